//! Helpers for the live-directory tests. They expect a Samba AD domain
//! controller container listening on localhost with the constants below.

use std::error::Error;

use ad_searcher::Config;
use ldap3::LdapConnAsync;
use url::Url;

pub const URL: &str = "ldap://localhost:3389";
pub const BASE_DN: &str = "dc=example,dc=org";
pub const SCHEMA_BASE_DN: &str = "cn=Schema,cn=Configuration,dc=example,dc=org";
pub const ADMIN_DN: &str = "cn=Administrator,cn=Users,dc=example,dc=org";
pub const ADMIN_PASSWORD: &str = "Passw0rd!";

pub fn ad_config() -> Result<Config, Box<dyn Error>> {
	Ok(Config::new(Url::parse(URL)?, ADMIN_DN, ADMIN_PASSWORD, BASE_DN, SCHEMA_BASE_DN))
}

pub async fn ldap_connect() -> Result<ldap3::Ldap, Box<dyn Error>> {
	let (conn, mut ldap) = LdapConnAsync::new(URL).await?;
	let _handle = tokio::spawn(async move {
		if let Err(err) = conn.drive().await {
			panic!("Ldap connection error {err}");
		}
	});
	ldap.simple_bind(ADMIN_DN, ADMIN_PASSWORD).await?.success()?;
	Ok(ldap)
}

pub async fn ldap_add_user(
	ldap: &mut ldap3::Ldap,
	cn: &str,
	sn: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.add(
		&format!("cn={cn},cn=Users,{BASE_DN}"),
		vec![
			("objectClass", ["user"].into()),
			("sn", [sn].into()),
			("sAMAccountName", [cn].into()),
		],
	)
	.await?
	.success()?;
	Ok(())
}

pub async fn ldap_delete_user(ldap: &mut ldap3::Ldap, cn: &str) -> Result<(), Box<dyn Error>> {
	ldap.delete(&format!("cn={cn},cn=Users,{BASE_DN}")).await?.success()?;
	Ok(())
}

pub async fn ldap_add_group(
	ldap: &mut ldap3::Ldap,
	cn: &str,
	member_dns: &[String],
) -> Result<(), Box<dyn Error>> {
	let members: Vec<&str> = member_dns.iter().map(String::as_str).collect();
	let mut attrs = vec![("objectClass", ["group"].into()), ("sAMAccountName", [cn].into())];
	if !members.is_empty() {
		attrs.push(("member", members.into_iter().collect()));
	}
	ldap.add(&format!("cn={cn},cn=Users,{BASE_DN}"), attrs).await?.success()?;
	Ok(())
}

pub async fn ldap_delete_group(ldap: &mut ldap3::Ldap, cn: &str) -> Result<(), Box<dyn Error>> {
	ldap.delete(&format!("cn={cn},cn=Users,{BASE_DN}")).await?.success()?;
	Ok(())
}
