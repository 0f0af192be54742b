//! Config for the directory client.
use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use ldap3::LdapConnSettings;
use rustls::{Certificate, RootCertStore};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{error::Error, filter, schema};

/// Default page size for paged searches. Matches the usual AD server-side
/// limit.
const DEFAULT_PAGE_SIZE: i32 = 1000;

/// Client configuration.
///
/// Unknown options are rejected when deserializing. Hand construction goes
/// through [`Config::new`], which fills every optional field with its
/// default.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
	/// The URL to connect to the server with. Supports ldap, ldaps, and
	/// ldapi schemes
	pub url: Url,
	/// Connection settings.
	#[serde(default)]
	pub connection: ConnectionConfig,
	/// The username for the LDAP search user
	pub search_user: String,
	/// The password for the LDAP search user
	pub search_password: String,
	/// Default search base: the DN of the domain.
	pub base_dn: String,
	/// Where the `attributeSchema` objects live, usually
	/// `cn=Schema,cn=Configuration,<domain>`.
	pub schema_base_dn: String,
	/// Search base for transitive-membership expansion. Defaults to
	/// [`Config::base_dn`].
	#[serde(default)]
	pub transitive_base_dn: Option<String>,
	/// Whether queries expand transitive membership client-side unless they
	/// say otherwise.
	#[serde(default)]
	pub transitive_default: bool,
	/// Cardinality overrides applied before the schema bootstrap: attribute
	/// name to whether it is single-valued. An override must disagree with
	/// the directory schema, otherwise it is reported as redundant.
	#[serde(default)]
	pub override_single_valued: HashMap<String, bool>,
	/// Page size for the [simple paged search control].
	///
	/// [simple paged search control]: https://www.rfc-editor.org/rfc/rfc2696.html
	#[serde(default = "default_page_size")]
	pub page_size: i32,
	/// Retired name of [`Config::override_single_valued`]; present only so
	/// that old configurations fail with a pointed message.
	#[serde(default, rename = "isSingleValued", skip_serializing)]
	pub(crate) retired_single_valued: Option<serde_json::Value>,
}

fn default_page_size() -> i32 {
	DEFAULT_PAGE_SIZE
}

impl Config {
	/// A configuration with the given required fields and every optional
	/// field at its default.
	#[must_use]
	pub fn new(
		url: Url,
		search_user: impl Into<String>,
		search_password: impl Into<String>,
		base_dn: impl Into<String>,
		schema_base_dn: impl Into<String>,
	) -> Self {
		Config {
			url,
			connection: ConnectionConfig::default(),
			search_user: search_user.into(),
			search_password: search_password.into(),
			base_dn: base_dn.into(),
			schema_base_dn: schema_base_dn.into(),
			transitive_base_dn: None,
			transitive_default: false,
			override_single_valued: HashMap::new(),
			page_size: DEFAULT_PAGE_SIZE,
			retired_single_valued: None,
		}
	}

	/// The base DN transitive-membership expansion searches under.
	#[must_use]
	pub fn transitive_base(&self) -> &str {
		self.transitive_base_dn.as_deref().unwrap_or(&self.base_dn)
	}

	pub(crate) fn validate(&self) -> Result<(), Error> {
		if self.retired_single_valued.is_some() {
			return Err(Error::Config(
				"option \"isSingleValued\" was renamed to \"override_single_valued\"".to_owned(),
			));
		}
		validate_dn(&self.base_dn)?;
		validate_dn(&self.schema_base_dn)?;
		if let Some(dn) = &self.transitive_base_dn {
			validate_dn(dn)?;
		}
		if self.page_size <= 0 {
			return Err(Error::Config(format!("page_size must be positive, got {}", self.page_size)));
		}
		for name in self.override_single_valued.keys() {
			if schema::BOOTSTRAP_ATTRIBUTES.contains(&name.as_str()) {
				return Err(Error::Config(format!(
					"{name:?} is needed to bootstrap the schema and cannot be overridden"
				)));
			}
			if !filter::is_valid_attribute_name(name) {
				return Err(Error::Config(format!(
					"invalid attribute name {name:?} in override_single_valued"
				)));
			}
		}
		Ok(())
	}
}

/// Structural well-formedness check for a distinguished name: nonempty,
/// and every (escape-aware) comma-separated component is `attr=value`.
/// Full DN semantics are left to the server.
pub(crate) fn validate_dn(dn: &str) -> Result<(), Error> {
	let mut components = Vec::new();
	let mut start = 0;
	let mut escaped = false;
	for (index, c) in dn.char_indices() {
		if escaped {
			escaped = false;
			continue;
		}
		match c {
			'\\' => escaped = true,
			',' => {
				components.push(&dn[start..index]);
				start = index + 1;
			}
			_ => {}
		}
	}
	components.push(&dn[start..]);
	let well_formed = !dn.is_empty()
		&& !escaped
		&& components.iter().all(|component| {
			component
				.split_once('=')
				.is_some_and(|(attr, value)| !attr.trim().is_empty() && !value.trim().is_empty())
		});
	if well_formed {
		Ok(())
	} else {
		Err(Error::Config(format!("malformed distinguished name {dn:?}")))
	}
}

/// Configuration for how to connect to the LDAP server. Uses defaults from
/// [`LdapConnSettings`] for unset values.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
	/// Timeout to establish a connection in seconds. Infinite if unset.
	#[serde(default)]
	pub timeout: Option<u64>,

	/// Use StartTLS extended operation for establishing a secure connection,
	/// rather than TLS on a dedicated port. False if unset.
	#[serde(default)]
	pub starttls: Option<bool>,

	/// Disable verification of TLS certificates. False if unset.
	#[serde(default)]
	pub no_tls_verify: Option<bool>,

	/// Optional TLS config
	#[serde(default)]
	pub tls: Option<TLSConfig>,
}

/// TLS Configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TLSConfig {
	/// TLS root certificate path
	pub root_certificate_path: PathBuf,
}

impl ConnectionConfig {
	/// Create a [`LdapConnSettings`] based on this [`ConnectionConfig`]
	pub(crate) async fn to_settings(&self) -> Result<LdapConnSettings, Error> {
		let mut settings = LdapConnSettings::new();
		if let Some(timeout) = self.timeout {
			settings = settings.set_conn_timeout(Duration::from_secs(timeout));
		}
		if let Some(starttls) = self.starttls {
			settings = settings.set_starttls(starttls);
		}
		if let Some(no_tls_verify) = self.no_tls_verify {
			settings = settings.set_no_tls_verify(no_tls_verify);
		}
		if let Some(config) = &self.tls {
			let contents = tokio::fs::read(&config.root_certificate_path).await?;
			let certs = rustls_pemfile::certs(&mut contents.as_slice())?;
			if certs.is_empty() {
				return Err(Error::Config("No certificates found".to_owned()));
			}
			let mut store = RootCertStore::empty();
			for cert in certs.into_iter().map(Certificate) {
				store.add(&cert)?;
			}
			let client_config = rustls::ClientConfig::builder()
				.with_safe_defaults()
				.with_root_certificates(Arc::new(store))
				.with_no_client_auth();
			settings = settings.set_config(client_config.into());
		}
		Ok(settings)
	}
}
