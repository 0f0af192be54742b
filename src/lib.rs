//! Streamed, injection-safe search client for Microsoft Active Directory.
//!
//! The library wraps a paged LDAP search in a lazy producer/consumer
//! pipeline so that arbitrarily large result sets can be iterated with
//! bounded memory. Filters are built from a structured expression tree and
//! compiled to RFC 2254 strings with validation and escaping, which makes
//! filter injection impossible by construction. On first use the client
//! reads the directory's attribute schema to learn which attributes are
//! single- or multi-valued and how to decode their values (booleans,
//! integers, timestamps, SIDs, GUIDs), and every returned entry is
//! normalized against that knowledge. Range-limited multi-valued
//! attributes (`member;range=0-1499`) are reassembled transparently before
//! an entry is yielded.
//!
//! For a general primer on LDAP, the [introduction] in the `ldap3` crate
//! which is used here for interfacing with LDAP is an excellent resource.
//!
//! [introduction]: https://github.com/inejge/ldap3/blob/master/LDAP-primer.md
//!
//! # Getting started
//! A minimal example of running a search might look like so:
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use ad_searcher::{ActiveDirectory, Config, Filter, SearchQuery, Select};
//! use url::Url;
//!
//! // Configuration can also be deserialized with serde. It's
//! // hand-constructed here for demonstration purposes.
//! let config = Config::new(
//!     Url::parse("ldap://dc01.example.org")?,
//!     "searcher@example.org",
//!     "verysecret",
//!     "dc=example,dc=org",
//!     "cn=Schema,cn=Configuration,dc=example,dc=org",
//! );
//!
//! let client = ActiveDirectory::new(config)?;
//! let query = SearchQuery::new(Filter::and(vec![
//!     Filter::equals("objectClass", "user"),
//!     Filter::begins_with("sAMAccountName", "jane"),
//! ]))
//! .select(Select::Attributes(vec!["cn".to_owned(), "memberOf".to_owned()]));
//!
//! let mut results = client.search(query).await?;
//! while let Some(record) = results.next().await? {
//!     println!("{record:?}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Transitive membership
//! The virtual attributes `_transitive_member` and `_transitive_memberOf`
//! match in-chain group membership. With client-side expansion enabled
//! (per query or via [`Config::transitive_default`]) they are rewritten
//! into flat filters over the real `member`/`memberOf` attributes before
//! anything is sent; otherwise they compile to the server-side
//! `1.2.840.113556.1.4.1941` matching rule, which most servers evaluate
//! much more slowly.
//!
//! # Limitations
//! * Referrals are not followed; a search that produces one fails.
//! * Write operations are out of scope, as is connection pooling beyond
//!   passing an existing connection into a query.
//! * Timestamps are rendered in UTC.

#![warn(missing_docs)]

pub mod client;
pub mod config;
mod decode;
mod entry;
pub mod error;
pub mod filter;
mod queue;
mod schema;
mod search;
mod transitive;

pub use ldap3::{self, Ldap, Scope, SearchEntry};

pub use crate::{
	client::{ActiveDirectory, SearchQuery, Select},
	config::{Config, ConnectionConfig, TLSConfig},
	decode::{DecodeError, Value},
	entry::{Record, RecordValue},
	error::Error,
	filter::{Filter, TRANSITIVE_MEMBER, TRANSITIVE_MEMBER_OF},
	search::SearchResults,
};
