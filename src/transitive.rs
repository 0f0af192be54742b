//! Client-side expansion of the virtual transitive-membership attributes.
//!
//! Active Directory can evaluate in-chain membership server-side through
//! the `1.2.840.113556.1.4.1941` matching rule, but that evaluation is
//! notoriously slow. When client-side expansion is enabled, every
//! `equals`/`oneof` on a virtual attribute is replaced with a flat `oneof`
//! over the real link attribute: the group graph is walked here, frontier
//! by frontier, with one LDAP search per round. The walk terminates because
//! the set of groups is finite and the accumulated set only grows.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use ldap3::{Ldap, Scope, SearchEntry};
use tracing::debug;

use crate::{
	error::Error,
	filter::{escape_value_into, virtual_link, Filter},
};

/// Lookup seam for one expansion round, so the walk is testable without a
/// directory server.
#[async_trait]
pub(crate) trait GroupDirectory {
	/// DNs of all groups whose `link` attribute holds any of the frontier
	/// DNs.
	async fn groups_linked_to(
		&mut self,
		link: &str,
		frontier: &[String],
	) -> Result<Vec<String>, Error>;
}

/// The real implementation: one subtree search per round over the
/// configured base, on the same connection as the outer search.
pub(crate) struct LdapGroupDirectory<'a> {
	pub(crate) ldap: &'a mut Ldap,
	pub(crate) base: &'a str,
}

#[async_trait]
impl GroupDirectory for LdapGroupDirectory<'_> {
	async fn groups_linked_to(
		&mut self,
		link: &str,
		frontier: &[String],
	) -> Result<Vec<String>, Error> {
		let filter = round_filter(link, frontier);
		let (entries, _result) = self
			.ldap
			.search(self.base, Scope::Subtree, &filter, vec!["distinguishedName"])
			.await?
			.success()?;
		Ok(entries.into_iter().map(|entry| SearchEntry::construct(entry).dn).collect())
	}
}

/// `(&(objectClass=group)(objectCategory=group)(|(<link>=dn)…))` with every
/// DN escaped. Built directly because frontier DNs are not subject to the
/// user-facing value length limit.
fn round_filter(link: &str, frontier: &[String]) -> String {
	let mut out = String::from("(&(objectClass=group)(objectCategory=group)(|");
	for dn in frontier {
		out.push('(');
		out.push_str(link);
		out.push('=');
		escape_value_into(&mut out, dn);
		out.push(')');
	}
	out.push_str("))");
	out
}

/// Replace every virtual-attribute `equals`/`oneof` in `filter` with its
/// flat expansion. The expression structure is preserved; identical targets
/// are resolved once.
pub(crate) async fn expand<D: GroupDirectory + Send>(
	filter: &Filter,
	directory: &mut D,
) -> Result<Filter, Error> {
	let mut targets = Vec::new();
	collect_targets(filter, &mut targets);
	if targets.is_empty() {
		return Ok(filter.clone());
	}
	let mut resolved: HashMap<(&'static str, Vec<String>), Filter> = HashMap::new();
	for (link, seeds) in targets {
		if resolved.contains_key(&(link, seeds.clone())) {
			continue;
		}
		let expanded = resolve(link, &seeds, directory).await?;
		resolved.insert((link, seeds), Filter::OneOf(link.to_owned(), expanded));
	}
	substitute(filter, &resolved)
}

/// Walk the group graph from `seeds` until no new group turns up. The
/// seeds themselves are part of the result, so an object linked directly
/// to one of them matches.
async fn resolve<D: GroupDirectory + Send>(
	link: &'static str,
	seeds: &[String],
	directory: &mut D,
) -> Result<Vec<String>, Error> {
	let mut all: Vec<String> = seeds.to_vec();
	let mut seen: HashSet<String> = seeds.iter().cloned().collect();
	let mut frontier: Vec<String> = seeds.to_vec();
	while !frontier.is_empty() {
		let found = directory.groups_linked_to(link, &frontier).await?;
		frontier = found.into_iter().filter(|dn| seen.insert(dn.clone())).collect();
		all.extend(frontier.iter().cloned());
		debug!(link, discovered = frontier.len(), total = all.len(), "transitive expansion round");
	}
	Ok(all)
}

fn collect_targets(filter: &Filter, out: &mut Vec<(&'static str, Vec<String>)>) {
	match filter {
		Filter::And(children) | Filter::Or(children) => {
			for child in children {
				collect_targets(child, out);
			}
		}
		Filter::Not(child) => collect_targets(child, out),
		Filter::Equals(attribute, value) => {
			if let Some(link) = virtual_link(attribute) {
				out.push((link, vec![value.clone()]));
			}
		}
		Filter::OneOf(attribute, values) => {
			if let Some(link) = virtual_link(attribute) {
				out.push((link, values.clone()));
			}
		}
		_ => {}
	}
}

fn substitute(
	filter: &Filter,
	resolved: &HashMap<(&'static str, Vec<String>), Filter>,
) -> Result<Filter, Error> {
	let lookup = |link: &'static str, seeds: Vec<String>| {
		resolved
			.get(&(link, seeds))
			.cloned()
			.ok_or_else(|| Error::Filter("virtual attribute expansion missed a target".to_owned()))
	};
	Ok(match filter {
		Filter::And(children) => Filter::And(
			children.iter().map(|c| substitute(c, resolved)).collect::<Result<Vec<_>, _>>()?,
		),
		Filter::Or(children) => Filter::Or(
			children.iter().map(|c| substitute(c, resolved)).collect::<Result<Vec<_>, _>>()?,
		),
		Filter::Not(child) => Filter::not(substitute(child, resolved)?),
		Filter::Equals(attribute, value) => match virtual_link(attribute) {
			Some(link) => lookup(link, vec![value.clone()])?,
			None => filter.clone(),
		},
		Filter::OneOf(attribute, values) => match virtual_link(attribute) {
			Some(link) => lookup(link, values.clone())?,
			None => filter.clone(),
		},
		other => other.clone(),
	})
}
