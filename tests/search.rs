#![allow(
	clippy::expect_used,
	clippy::missing_docs_in_private_items,
	clippy::print_stderr,
	clippy::print_stdout,
	clippy::unwrap_used
)]
//! Tests against a live Samba AD domain controller. All of them are gated
//! behind `--ignored` because they need the docker environment running.

use std::error::Error;

use ad_searcher::{ActiveDirectory, Filter, RecordValue, SearchQuery, Select, Value};
use serial_test::serial;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

mod common;

use common::{
	ad_config, ldap_add_group, ldap_add_user, ldap_connect, ldap_delete_group, ldap_delete_user,
	BASE_DN,
};

fn user_dn(cn: &str) -> String {
	format!("cn={cn},cn=Users,{BASE_DN}")
}

#[ignore = "docker"]
#[tokio::test]
#[serial]
async fn bootstrap_and_first_search_shapes() -> Result<(), Box<dyn Error>> {
	let tracing_filter = EnvFilter::default().add_directive(LevelFilter::DEBUG.into());
	tracing_subscriber::fmt().with_env_filter(tracing_filter).init();

	let mut ldap = ldap_connect().await?;
	let _ = ldap_delete_user(&mut ldap, "shapeuser").await;
	ldap_add_user(&mut ldap, "shapeuser", "Shape").await?;

	let client = ActiveDirectory::new(ad_config()?)?;
	let query = SearchQuery::new(Filter::has("cn"))
		.select(Select::Attributes(vec!["cn".to_owned(), "member".to_owned()]));
	let mut results = client.search(query).await?;

	let mut count = 0;
	while let Some(record) = results.next().await? {
		count += 1;
		assert!(
			record.keys().all(|key| key == "cn" || key == "member"),
			"only selected attributes may appear: {record:?}"
		);
		if let Some(cn) = record.get("cn") {
			assert!(
				matches!(cn, RecordValue::One(Value::Text(_))),
				"cn is single-valued text: {cn:?}"
			);
		}
		if let Some(member) = record.get("member") {
			assert!(matches!(member, RecordValue::Many(_)), "member is a list: {member:?}");
		}
	}
	assert!(count > 0, "the directory should contain at least the fixture user");

	ldap_delete_user(&mut ldap, "shapeuser").await?;
	ldap.unbind().await?;
	Ok(())
}

#[ignore = "docker"]
#[tokio::test]
#[serial]
async fn search_one_rejects_zero_and_many() -> Result<(), Box<dyn Error>> {
	let mut ldap = ldap_connect().await?;
	for cn in ["pair01", "pair02"] {
		let _ = ldap_delete_user(&mut ldap, cn).await;
		ldap_add_user(&mut ldap, cn, "Pair").await?;
	}

	let client = ActiveDirectory::new(ad_config()?)?;

	let one = client
		.search_one(SearchQuery::new(Filter::equals("sAMAccountName", "pair01")))
		.await?;
	assert!(!one.is_empty());

	let none = client
		.search_one(SearchQuery::new(Filter::equals("sAMAccountName", "no-such-user")))
		.await;
	assert!(
		matches!(none, Err(ad_searcher::Error::NotSingle { found: 0 })),
		"zero matches must fail: {none:?}"
	);

	let many = client
		.search_one(SearchQuery::new(Filter::begins_with("sAMAccountName", "pair0")))
		.await;
	assert!(
		matches!(many, Err(ad_searcher::Error::NotSingle { found: 2 })),
		"two matches must fail: {many:?}"
	);

	for cn in ["pair01", "pair02"] {
		ldap_delete_user(&mut ldap, cn).await?;
	}
	ldap.unbind().await?;
	Ok(())
}

#[ignore = "docker"]
#[tokio::test]
#[serial]
async fn supplied_connections_are_reused_and_left_open() -> Result<(), Box<dyn Error>> {
	let mut ldap = ldap_connect().await?;
	let _ = ldap_delete_user(&mut ldap, "connuser").await;
	ldap_add_user(&mut ldap, "connuser", "Conn").await?;

	let client = ActiveDirectory::new(ad_config()?)?;
	let mut query = SearchQuery::new(Filter::equals("sAMAccountName", "connuser"));
	query.connection = Some(ldap.clone());
	let records = client.search_all(query).await?;
	assert_eq!(records.len(), 1);

	// The connection must still be usable afterwards.
	ldap.search(BASE_DN, ad_searcher::Scope::Subtree, "(sAMAccountName=connuser)", vec!["cn"])
		.await?
		.success()?;

	ldap_delete_user(&mut ldap, "connuser").await?;
	ldap.unbind().await?;
	Ok(())
}

#[ignore = "docker"]
#[tokio::test]
#[serial]
async fn transitive_expansion_matches_nested_members() -> Result<(), Box<dyn Error>> {
	let mut ldap = ldap_connect().await?;
	for group in ["inner-grp", "outer-grp"] {
		let _ = ldap_delete_group(&mut ldap, group).await;
	}
	let _ = ldap_delete_user(&mut ldap, "nesteduser").await;

	ldap_add_user(&mut ldap, "nesteduser", "Nested").await?;
	ldap_add_group(&mut ldap, "inner-grp", &[user_dn("nesteduser")]).await?;
	ldap_add_group(&mut ldap, "outer-grp", &[format!("cn=inner-grp,cn=Users,{BASE_DN}")]).await?;

	let client = ActiveDirectory::new(ad_config()?)?;
	let mut query = SearchQuery::new(Filter::equals(
		"_transitive_memberOf",
		format!("cn=outer-grp,cn=Users,{BASE_DN}"),
	))
	.select(Select::Attributes(vec!["distinguishedName".to_owned()]));
	query.transitive = Some(true);

	let records = client.search_all(query).await?;
	let dns: Vec<String> = records
		.iter()
		.filter_map(|record| match record.get("distinguishedName") {
			Some(RecordValue::One(Value::Text(dn))) => Some(dn.clone()),
			_ => None,
		})
		.collect();
	assert!(
		dns.iter().any(|dn| dn.eq_ignore_ascii_case(&user_dn("nesteduser"))),
		"the nested user must match through the group chain: {dns:?}"
	);

	ldap_delete_group(&mut ldap, "outer-grp").await?;
	ldap_delete_group(&mut ldap, "inner-grp").await?;
	ldap_delete_user(&mut ldap, "nesteduser").await?;
	ldap.unbind().await?;
	Ok(())
}
