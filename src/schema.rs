//! The bootstrapped attribute schema: cardinality, boolean attributes and
//! decoder assignment.
//!
//! Active Directory publishes one `attributeSchema` object per attribute.
//! The client reads them once, on first use, to learn whether each
//! attribute is single- or multi-valued and which decoder applies to its
//! values. The resulting map is written only during bootstrap and read-only
//! afterwards.

use std::{
	collections::{HashMap, HashSet},
	sync::atomic::{AtomicBool, Ordering},
	time::{Duration, Instant},
};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::{
	decode::{Decoder, Value},
	entry::{Record, RecordValue},
	error::Error,
};

/// The attributes the bootstrap search selects. They are seeded into the
/// schema map as single-valued before the search runs, because the search's
/// own results have to be normalized against something.
pub(crate) const BOOTSTRAP_ATTRIBUTES: [&str; 3] =
	["lDAPDisplayName", "attributeSyntax", "isSingleValued"];

/// Minimum delay between two bootstrap attempts after a failure.
pub(crate) const BOOTSTRAP_RETRY: Duration = Duration::from_secs(10);

/// Attributes stored as NT filetimes even though their declared syntax says
/// large integer.
const FILETIME_ATTRIBUTES: [&str; 3] = ["accountExpires", "badPasswordTime", "lastLogonTimestamp"];

const SYNTAX_BOOLEAN: &str = "2.5.5.8";
const SYNTAX_INTEGER: &str = "2.5.5.9";
const SYNTAX_OCTET_STRING: &str = "2.5.5.10";
const SYNTAX_GENERALIZED_TIME: &str = "2.5.5.11";
const SYNTAX_NT_SECURITY_DESCRIPTOR: &str = "2.5.5.15";
const SYNTAX_SID: &str = "2.5.5.17";

/// Syntaxes that are known but decode as plain text.
const SYNTAX_PASSTHROUGH: [&str; 10] = [
	"2.5.5.1", "2.5.5.2", "2.5.5.4", "2.5.5.5", "2.5.5.6", "2.5.5.7", "2.5.5.12", "2.5.5.13",
	"2.5.5.14", "2.5.5.16",
];

/// What the schema knows about one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AttributeInfo {
	/// Whether results carry a scalar (true) or a list (false).
	pub(crate) single_valued: bool,
	/// Whether the attribute has Boolean syntax (restricts filters).
	pub(crate) boolean: bool,
	/// The decoder applied to every value, if any.
	pub(crate) decoder: Option<Decoder>,
}

/// Shared schema state owned by the client façade.
#[derive(Debug)]
pub(crate) struct SchemaState {
	/// The schema map. Written during bootstrap, read-only afterwards.
	pub(crate) attributes: RwLock<HashMap<String, AttributeInfo>>,
	/// Set once bootstrap completed successfully.
	pub(crate) initialized: AtomicBool,
	/// Single-flight gate for bootstrap; holds the time of the last
	/// attempt for throttling.
	pub(crate) gate: Mutex<Option<Instant>>,
	/// Cardinality overrides from the configuration.
	overrides: HashMap<String, bool>,
}

impl SchemaState {
	pub(crate) fn new(overrides: HashMap<String, bool>) -> Self {
		let mut attributes = HashMap::new();
		for name in BOOTSTRAP_ATTRIBUTES {
			attributes.insert(
				name.to_owned(),
				AttributeInfo { single_valued: true, boolean: false, decoder: None },
			);
		}
		for (name, single_valued) in &overrides {
			attributes.insert(
				name.clone(),
				AttributeInfo { single_valued: *single_valued, boolean: false, decoder: None },
			);
		}
		SchemaState {
			attributes: RwLock::new(attributes),
			initialized: AtomicBool::new(false),
			gate: Mutex::new(None),
			overrides,
		}
	}

	pub(crate) fn is_initialized(&self) -> bool {
		self.initialized.load(Ordering::Acquire)
	}

	pub(crate) fn overrides(&self) -> &HashMap<String, bool> {
		&self.overrides
	}

	/// Snapshot of the attributes with Boolean syntax, for filter
	/// compilation.
	pub(crate) async fn booleans(&self) -> HashSet<String> {
		self.attributes
			.read()
			.await
			.iter()
			.filter(|(_, info)| info.boolean)
			.map(|(name, _)| name.clone())
			.collect()
	}
}

/// Pick the decoder for an attribute: the filetime table always wins, then
/// the syntax OID decides, with octet strings sniffed by name for GUIDs.
/// Unknown syntaxes are logged and left undecoded.
pub(crate) fn decoder_for(name: &str, syntax: &str) -> Option<Decoder> {
	if FILETIME_ATTRIBUTES.contains(&name) {
		return Some(Decoder::FileTime);
	}
	match syntax {
		SYNTAX_BOOLEAN => Some(Decoder::Bool),
		SYNTAX_INTEGER => Some(Decoder::Int32),
		SYNTAX_GENERALIZED_TIME => Some(Decoder::GeneralizedTime),
		SYNTAX_NT_SECURITY_DESCRIPTOR => Some(Decoder::OctetString),
		SYNTAX_SID => Some(Decoder::Sid),
		SYNTAX_OCTET_STRING => {
			if name.ends_with("GUID") || name.ends_with("Guid") {
				Some(Decoder::Guid)
			} else {
				Some(Decoder::OctetString)
			}
		}
		known if SYNTAX_PASSTHROUGH.contains(&known) => None,
		unknown => {
			warn!(attribute = name, syntax = unknown, "unknown attribute syntax, not decoding");
			None
		}
	}
}

/// Fold one `attributeSchema` row into the map.
///
/// A name that already went past this bootstrap is a duplicate and fails.
/// The bootstrap seeds are overwritten freely. A configured override is
/// kept when it disagrees with the directory (that is what overrides are
/// for) and rejected as redundant when it agrees.
pub(crate) fn apply_row(
	attributes: &mut HashMap<String, AttributeInfo>,
	seen: &mut HashSet<String>,
	overrides: &HashMap<String, bool>,
	name: &str,
	syntax: &str,
	single_valued: bool,
) -> Result<(), Error> {
	if !seen.insert(name.to_owned()) {
		return Err(Error::Schema(format!("duplicate schema entry for attribute {name:?}")));
	}
	let resolved_single = match overrides.get(name) {
		Some(&configured) if configured == single_valued => {
			return Err(Error::Schema(format!(
				"override for {name:?} matches the directory schema; remove it"
			)));
		}
		Some(&configured) => {
			debug!(
				attribute = name,
				schema = single_valued,
				configured,
				"cardinality override takes precedence over the directory schema"
			);
			configured
		}
		None => single_valued,
	};
	attributes.insert(
		name.to_owned(),
		AttributeInfo {
			single_valued: resolved_single,
			boolean: syntax == SYNTAX_BOOLEAN,
			decoder: decoder_for(name, syntax),
		},
	);
	Ok(())
}

/// Sanity checks after a full bootstrap pass.
pub(crate) fn verify(attributes: &HashMap<String, AttributeInfo>) -> Result<(), Error> {
	match attributes.get("member") {
		None => {
			return Err(Error::Schema(
				"the schema has no \"member\" attribute; this does not look like an Active \
				 Directory schema naming context"
					.to_owned(),
			));
		}
		Some(info) if info.single_valued => {
			return Err(Error::Schema("\"member\" bootstrapped as single-valued".to_owned()));
		}
		Some(_) => {}
	}
	for name in ["attributeSyntax", "distinguishedName", "lDAPDisplayName", "member", "objectClass"]
	{
		if attributes.get(name).is_some_and(|info| info.boolean) {
			return Err(Error::Schema(format!("attribute {name:?} bootstrapped as boolean")));
		}
	}
	Ok(())
}

/// Pull `(name, syntax, single_valued)` out of one bootstrap result row.
///
/// `isSingleValued` arrives as the text `TRUE`/`FALSE` early in the
/// bootstrap and as a decoded boolean once the schema row for
/// `isSingleValued` itself has installed the boolean decoder; both forms
/// are accepted.
pub(crate) fn row_fields(record: &Record) -> Option<(String, String, bool)> {
	let name = single_text(record, "lDAPDisplayName")?;
	let syntax = single_text(record, "attributeSyntax")?;
	let single_valued = match record.get("isSingleValued")? {
		RecordValue::One(Value::Text(text)) if text == "TRUE" => true,
		RecordValue::One(Value::Text(text)) if text == "FALSE" => false,
		RecordValue::One(Value::Bool(flag)) => *flag,
		_ => return None,
	};
	Some((name.to_owned(), syntax.to_owned(), single_valued))
}

fn single_text<'a>(record: &'a Record, key: &str) -> Option<&'a str> {
	match record.get(key)? {
		RecordValue::One(Value::Text(text)) => Some(text),
		_ => None,
	}
}
