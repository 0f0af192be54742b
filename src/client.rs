//! The Active Directory client: configuration validation, connection
//! handling, lazy schema bootstrap and the public search operations.

use std::{
	collections::HashSet,
	sync::{atomic::Ordering, Arc},
	time::Instant,
};

use ldap3::{Ldap, LdapConnAsync, Scope};
use tracing::{debug, info, warn};

use crate::{
	config::{self, Config},
	entry::{Record, DISTINGUISHED_NAME},
	error::Error,
	filter::{self, Filter},
	schema::{self, SchemaState, BOOTSTRAP_ATTRIBUTES, BOOTSTRAP_RETRY},
	search::{SearchResults, SearchTask},
	transitive::{self, LdapGroupDirectory},
};

/// Which attributes a search should return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Select {
	/// Every attribute the server is willing to return.
	All,
	/// Exactly these attributes. The two virtual transitive attributes are
	/// accepted here but never sent on the wire.
	Attributes(Vec<String>),
}

/// One search request.
///
/// Only the filter is mandatory; everything else has a default:
/// select-all, the configured domain base, subtree scope, the configured
/// transitive setting, waiting for schema initialization, and a fresh
/// connection for the duration of the search.
pub struct SearchQuery {
	/// Which attributes to return.
	pub select: Select,
	/// Search base; the configured domain base when unset.
	pub base: Option<String>,
	/// The filter expression.
	pub filter: Filter,
	/// Search scope.
	pub scope: Scope,
	/// Whether to expand transitive membership client-side; the configured
	/// default when unset.
	pub transitive: Option<bool>,
	/// Whether to bootstrap the schema first. Only the bootstrap itself
	/// runs with this off; results are then untyped.
	pub wait_for_initialization: bool,
	/// Run the search over this bound connection instead of opening one.
	/// A supplied connection is never unbound by the client.
	pub connection: Option<Ldap>,
}

impl SearchQuery {
	/// A query for `filter` with every other field at its default.
	#[must_use]
	pub fn new(filter: Filter) -> Self {
		SearchQuery {
			select: Select::All,
			base: None,
			filter,
			scope: Scope::Subtree,
			transitive: None,
			wait_for_initialization: true,
			connection: None,
		}
	}

	/// Replace the attribute selection.
	#[must_use]
	pub fn select(mut self, select: Select) -> Self {
		self.select = select;
		self
	}

	/// Replace the search base.
	#[must_use]
	pub fn base(mut self, base: impl Into<String>) -> Self {
		self.base = Some(base.into());
		self
	}

	/// Replace the search scope.
	#[must_use]
	pub fn scope(mut self, scope: Scope) -> Self {
		self.scope = scope;
		self
	}
}

impl Default for SearchQuery {
	fn default() -> Self {
		SearchQuery::new(Filter::True)
	}
}

/// Holds data and provides the search interface for one directory.
///
/// Constructed once and kept for the lifetime of the process; the first
/// search triggers the schema bootstrap. Cloning is cheap and clones share
/// the bootstrapped schema.
#[derive(Clone, Debug)]
pub struct ActiveDirectory {
	config: Config,
	schema: Arc<SchemaState>,
}

impl ActiveDirectory {
	/// Validate `config` and create a client. No connection is made yet.
	pub fn new(config: Config) -> Result<Self, Error> {
		config.validate()?;
		let schema = Arc::new(SchemaState::new(config.override_single_valued.clone()));
		Ok(ActiveDirectory { config, schema })
	}

	/// Run a search and return the lazy result stream.
	pub async fn search(&self, query: SearchQuery) -> Result<SearchResults, Error> {
		self.validate_query(&query)?;
		if query.wait_for_initialization {
			self.ensure_initialized().await?;
		}
		self.start_search(query).await
	}

	/// Run a search and collect every record. Memory is proportional to
	/// the result set.
	pub async fn search_all(&self, query: SearchQuery) -> Result<Vec<Record>, Error> {
		let mut results = self.search(query).await?;
		let mut records = Vec::new();
		while let Some(record) = results.next().await? {
			records.push(record);
		}
		Ok(records)
	}

	/// Run a search that must match exactly one object and return its
	/// record. Zero matches and several matches are both failures.
	pub async fn search_one(&self, query: SearchQuery) -> Result<Record, Error> {
		let mut results = self.search(query).await?;
		let Some(record) = results.next().await? else {
			return Err(Error::NotSingle { found: 0 });
		};
		if results.next().await?.is_some() {
			return Err(Error::NotSingle { found: 2 });
		}
		Ok(record)
	}

	/// The part of a search that runs below the initialization guard; the
	/// schema bootstrap enters here directly.
	async fn start_search(&self, query: SearchQuery) -> Result<SearchResults, Error> {
		let booleans = self.schema.booleans().await;
		// Surface filter validation errors before any network round trip.
		let compiled = query.filter.compile(&booleans)?;
		let transitive = query.transitive.unwrap_or(self.config.transitive_default);

		let (mut ldap, owns_connection) = match query.connection {
			Some(ldap) => (ldap, false),
			None => (self.connect().await?, true),
		};

		let wire_filter = if transitive {
			match self.expand_filter(&query.filter, &mut ldap, &booleans).await {
				Ok(wire_filter) => wire_filter,
				Err(error) => {
					if owns_connection {
						if let Err(unbind_error) = ldap.unbind().await {
							warn!(error = %unbind_error, "failed to release the connection");
						}
					}
					return Err(error);
				}
			}
		} else {
			compiled
		};

		let (attributes, requested, keep_dn) = wire_attributes(&query.select);
		let task = SearchTask {
			ldap,
			owns_connection,
			schema: Arc::clone(&self.schema),
			base: query.base.unwrap_or_else(|| self.config.base_dn.clone()),
			scope: query.scope,
			filter: wire_filter,
			attributes,
			requested,
			keep_dn,
			page_size: self.config.page_size,
			strict: self.schema.is_initialized(),
		};
		debug!(base = task.base.as_str(), filter = task.filter.as_str(), "starting search");
		Ok(task.spawn())
	}

	/// Expand transitive membership over the search's own connection and
	/// compile the result to the wire form.
	async fn expand_filter(
		&self,
		filter: &Filter,
		ldap: &mut Ldap,
		booleans: &HashSet<String>,
	) -> Result<String, Error> {
		let mut directory = LdapGroupDirectory { ldap, base: self.config.transitive_base() };
		let expanded = transitive::expand(filter, &mut directory).await?;
		expanded.compile(booleans)
	}

	/// Open and bind a fresh connection.
	async fn connect(&self) -> Result<Ldap, Error> {
		let settings = self.config.connection.to_settings().await?;
		let (conn, mut ldap) =
			LdapConnAsync::from_url_with_settings(settings, &self.config.url).await?;
		tokio::spawn(async move {
			if let Err(error) = conn.drive().await {
				warn!(%error, "connection handler finished with an error");
			}
		});
		ldap.simple_bind(&self.config.search_user, &self.config.search_password).await?.success()?;
		Ok(ldap)
	}

	/// Bootstrap the schema unless that already happened. Attempts are
	/// single-flight, and a failed attempt arms a throttle window within
	/// which further attempts fail immediately.
	async fn ensure_initialized(&self) -> Result<(), Error> {
		if self.schema.is_initialized() {
			return Ok(());
		}
		let mut last_attempt = self.schema.gate.lock().await;
		if self.schema.is_initialized() {
			// Someone else bootstrapped while this task waited on the gate.
			return Ok(());
		}
		if let Some(at) = *last_attempt {
			if at.elapsed() < BOOTSTRAP_RETRY {
				return Err(Error::Schema(format!(
					"a bootstrap attempt failed less than {}s ago, not retrying yet",
					BOOTSTRAP_RETRY.as_secs()
				)));
			}
		}
		*last_attempt = Some(Instant::now());
		self.bootstrap().await
	}

	/// Read every `attributeSchema` object and populate the schema map.
	async fn bootstrap(&self) -> Result<(), Error> {
		info!(base = self.config.schema_base_dn.as_str(), "bootstrapping the attribute schema");
		let query = SearchQuery {
			select: Select::Attributes(
				BOOTSTRAP_ATTRIBUTES.iter().map(|name| (*name).to_owned()).collect(),
			),
			base: Some(self.config.schema_base_dn.clone()),
			filter: Filter::equals("objectClass", "attributeSchema"),
			scope: Scope::Subtree,
			transitive: Some(false),
			wait_for_initialization: false,
			connection: None,
		};
		let mut results = self.start_search(query).await?;
		let mut seen = HashSet::new();
		let mut count = 0_usize;
		while let Some(record) = results.next().await? {
			let Some((name, syntax, single_valued)) = schema::row_fields(&record) else {
				warn!("skipping a schema row with missing fields");
				continue;
			};
			let mut attributes = self.schema.attributes.write().await;
			schema::apply_row(
				&mut attributes,
				&mut seen,
				self.schema.overrides(),
				&name,
				&syntax,
				single_valued,
			)?;
			count += 1;
		}
		schema::verify(&*self.schema.attributes.read().await)?;
		self.schema.initialized.store(true, Ordering::Release);
		info!(attributes = count, "schema bootstrap complete");
		Ok(())
	}

	fn validate_query(&self, query: &SearchQuery) -> Result<(), Error> {
		if let Some(base) = &query.base {
			config::validate_dn(base)?;
		}
		if let Select::Attributes(names) = &query.select {
			for name in names {
				if filter::virtual_link(name).is_none() && !filter::is_valid_attribute_name(name) {
					return Err(Error::Config(format!(
						"invalid attribute name {name:?} in select"
					)));
				}
			}
		}
		Ok(())
	}
}

/// The attribute list for the wire, the set the caller may receive, and
/// whether `distinguishedName` stays in the output.
fn wire_attributes(select: &Select) -> (Vec<String>, Option<HashSet<String>>, bool) {
	match select {
		Select::All => (vec!["*".to_owned()], None, true),
		Select::Attributes(names) => {
			let mut wire = Vec::with_capacity(names.len() + 1);
			let mut requested = HashSet::new();
			for name in names {
				// Virtual attributes are a filter/select fiction; the
				// server must never see them.
				if filter::virtual_link(name).is_some() {
					continue;
				}
				if requested.insert(name.clone()) {
					wire.push(name.clone());
				}
			}
			let keep_dn = requested.contains(DISTINGUISHED_NAME);
			if !keep_dn {
				wire.push(DISTINGUISHED_NAME.to_owned());
			}
			(wire, Some(requested), keep_dn)
		}
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::collections::HashMap;

	use url::Url;

	use super::{wire_attributes, ActiveDirectory, SearchQuery, Select};
	use crate::{error::Error, filter::Filter};

	fn client() -> ActiveDirectory {
		let config = crate::config::Config::new(
			Url::parse("ldap://localhost:1389").unwrap(),
			"searcher@example.org",
			"verysecret",
			"dc=example,dc=org",
			"cn=Schema,cn=Configuration,dc=example,dc=org",
		);
		ActiveDirectory::new(config).unwrap()
	}

	#[test]
	fn construction_validates_the_config() {
		let mut config = crate::config::Config::new(
			Url::parse("ldap://localhost").unwrap(),
			"u",
			"p",
			"not a dn",
			"cn=Schema,dc=example,dc=org",
		);
		assert!(matches!(ActiveDirectory::new(config.clone()).unwrap_err(), Error::Config(_)));
		config.base_dn = "dc=example,dc=org".to_owned();
		config.override_single_valued = HashMap::from([("isSingleValued".to_owned(), true)]);
		assert!(matches!(ActiveDirectory::new(config).unwrap_err(), Error::Config(_)));
	}

	#[test]
	fn select_all_requests_a_star() {
		let (wire, requested, keep_dn) = wire_attributes(&Select::All);
		assert_eq!(wire, vec!["*".to_owned()]);
		assert!(requested.is_none());
		assert!(keep_dn);
	}

	#[test]
	fn select_list_adds_the_dn_and_strips_virtual_names() {
		let select = Select::Attributes(vec![
			"cn".to_owned(),
			"member".to_owned(),
			"cn".to_owned(),
			"_transitive_memberOf".to_owned(),
		]);
		let (wire, requested, keep_dn) = wire_attributes(&select);
		assert_eq!(wire, vec!["cn".to_owned(), "member".to_owned(), "distinguishedName".to_owned()]);
		let requested = requested.unwrap();
		assert_eq!(requested.len(), 2, "duplicates and virtual names are not requested");
		assert!(!keep_dn);
	}

	#[test]
	fn explicitly_selected_dn_is_kept() {
		let select = Select::Attributes(vec!["distinguishedName".to_owned(), "cn".to_owned()]);
		let (wire, _, keep_dn) = wire_attributes(&select);
		assert!(keep_dn);
		assert_eq!(
			wire.iter().filter(|name| *name == "distinguishedName").count(),
			1,
			"the DN is requested exactly once"
		);
	}

	#[tokio::test]
	async fn queries_are_validated_before_any_connection() {
		let client = client();

		let query = SearchQuery::new(Filter::True).base("not a dn");
		assert!(matches!(client.search(query).await.unwrap_err(), Error::Config(_)));

		let query = SearchQuery::new(Filter::True)
			.select(Select::Attributes(vec!["No Such Attribute".to_owned()]));
		assert!(matches!(client.search(query).await.unwrap_err(), Error::Config(_)));
	}

	#[tokio::test]
	async fn filter_shape_errors_surface_before_bootstrap() {
		let client = client();
		let mut query = SearchQuery::new(Filter::And(vec![]));
		// Even with the initialization guard bypassed, compilation runs
		// before any connection is opened.
		query.wait_for_initialization = false;
		assert!(matches!(client.search(query).await.unwrap_err(), Error::Filter(_)));
	}
}
