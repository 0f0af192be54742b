//! Error types

use crate::decode::DecodeError;

/// Errors that can occur when using this library
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// The client configuration was rejected at construction time.
	#[error("invalid configuration: {0}")]
	Config(String),
	/// A filter expression failed validation.
	#[error("invalid filter: {0}")]
	Filter(String),
	/// The attribute schema could not be bootstrapped, or produced
	/// inconsistent data.
	#[error("schema bootstrap: {0}")]
	Schema(String),
	/// An underlying protocol error occurred, or the server returned a
	/// non-success result code.
	#[error(transparent)]
	Ldap(#[from] ldap3::LdapError),
	/// The server attached a diagnostic message to an otherwise successful
	/// result.
	#[error("server diagnostic: {0}")]
	ServerMessage(String),
	/// The search produced referrals that this client does not follow.
	#[error("unhandled referral: {0:?}")]
	Referral(Vec<String>),
	/// A returned entry violated an invariant (empty entry, unselected
	/// attribute, cardinality mismatch, broken ranged chunk).
	#[error("entry {dn:?}: {message}")]
	Entry {
		/// Distinguished name of the offending entry.
		dn: String,
		/// What was wrong with it.
		message: String,
	},
	/// A raw attribute value failed to decode.
	#[error("attribute {attribute:?} of {dn:?}: {source}")]
	Decode {
		/// Distinguished name of the entry the value came from.
		dn: String,
		/// The attribute whose value failed to decode.
		attribute: String,
		/// The underlying decoder failure.
		source: DecodeError,
	},
	/// A search expected to match exactly one object matched zero or
	/// several.
	#[error("search returned {found} results where exactly one was expected")]
	NotSingle {
		/// How many results were observed (counting stops at two).
		found: usize,
	},

	/// An underlying IO error occurred.
	#[error(transparent)]
	Io(#[from] std::io::Error),

	/// An underlying Rustls error occurred.
	#[error(transparent)]
	Rustls(#[from] rustls::Error),
}

impl Error {
	/// Shorthand for an [`Error::Entry`] with the given DN and message.
	pub(crate) fn entry(dn: &str, message: impl Into<String>) -> Self {
		Error::Entry { dn: dn.to_owned(), message: message.into() }
	}
}
