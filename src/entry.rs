//! Search records and per-entry normalization.
//!
//! The transport hands back entries whose attribute values are untyped
//! lists of strings or bytes. Normalization checks every attribute against
//! the caller's selection and the attribute schema, applies the registered
//! decoder, and collapses single-valued attributes to scalars, so the
//! records a search yields always have the shape the schema dictates.

use std::collections::{HashMap, HashSet};

use ldap3::SearchEntry;
use serde::Serialize;

use crate::{
	decode::Value,
	error::Error,
	schema::AttributeInfo,
};

/// The attribute that is always requested on the wire and identifies an
/// entry in error reports.
pub(crate) const DISTINGUISHED_NAME: &str = "distinguishedName";

/// Pseudo-attributes some transports inject into entries; never part of the
/// result.
const IGNORED_ATTRIBUTES: [&str; 2] = ["controls", "dn"];

/// Trailing values re-requested with every ranged chunk for verification.
pub(crate) const RANGE_OVERLAP: usize = 10;

/// A normalized attribute value: a scalar for single-valued attributes, an
/// ordered list for multi-valued ones.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RecordValue {
	/// The attribute is single-valued per the schema.
	One(Value),
	/// The attribute is multi-valued per the schema.
	Many(Vec<Value>),
}

/// One normalized search result: requested attribute name to decoded value.
pub type Record = HashMap<String, RecordValue>;

/// One attribute value as delivered by the transport: the parsed text when
/// the value was valid UTF-8, and always the raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RawValue {
	pub(crate) text: Option<String>,
	pub(crate) bytes: Vec<u8>,
}

impl RawValue {
	pub(crate) fn text(value: String) -> Self {
		RawValue { bytes: value.clone().into_bytes(), text: Some(value) }
	}

	pub(crate) fn binary(bytes: Vec<u8>) -> Self {
		RawValue { text: None, bytes }
	}
}

/// Flatten a [`SearchEntry`] into `(dn, attribute, values)` tuples, merging
/// the transport's text and binary maps and dropping pseudo-attributes.
pub(crate) fn collect_raw(entry: SearchEntry) -> (String, Vec<(String, Vec<RawValue>)>) {
	let SearchEntry { dn, attrs, mut bin_attrs } = entry;
	let mut raw: Vec<(String, Vec<RawValue>)> = Vec::with_capacity(attrs.len() + bin_attrs.len());
	for (name, values) in attrs {
		if IGNORED_ATTRIBUTES.contains(&name.as_str()) {
			continue;
		}
		let mut collected: Vec<RawValue> = values.into_iter().map(RawValue::text).collect();
		// A single attribute can be split across both maps when only some
		// of its values are valid UTF-8.
		if let Some(binary) = bin_attrs.remove(&name) {
			collected.extend(binary.into_iter().map(RawValue::binary));
		}
		raw.push((name, collected));
	}
	for (name, values) in bin_attrs {
		if IGNORED_ATTRIBUTES.contains(&name.as_str()) {
			continue;
		}
		raw.push((name, values.into_iter().map(RawValue::binary).collect()));
	}
	(dn, raw)
}

/// How [`normalize_attribute`] should treat the entry's attributes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NormalizeContext<'a> {
	/// The schema map to take cardinality and decoders from.
	pub(crate) schema: &'a HashMap<String, AttributeInfo>,
	/// The attributes the caller selected; `None` means select-all.
	pub(crate) requested: Option<&'a HashSet<String>>,
	/// Whether `distinguishedName` was selected explicitly.
	pub(crate) keep_dn: bool,
	/// Whether unknown attributes are an error (true once the schema is
	/// initialized) or passed through untyped (during bootstrap).
	pub(crate) strict: bool,
}

/// Normalize one attribute of the entry at `dn`. Returns `None` for the
/// implicitly-requested `distinguishedName` when the caller did not select
/// it.
pub(crate) fn normalize_attribute(
	dn: &str,
	name: String,
	values: Vec<RawValue>,
	ctx: NormalizeContext<'_>,
) -> Result<Option<(String, RecordValue)>, Error> {
	if name == DISTINGUISHED_NAME && !ctx.keep_dn {
		return Ok(None);
	}
	if name != DISTINGUISHED_NAME {
		if let Some(requested) = ctx.requested {
			if !requested.contains(&name) {
				return Err(Error::entry(dn, format!("unexpected attribute {name:?}")));
			}
		}
	}
	let Some(info) = ctx.schema.get(&name) else {
		if ctx.strict {
			return Err(Error::entry(dn, format!("no cardinality information for {name:?}")));
		}
		// Mid-bootstrap the schema map is still being written; pass the
		// values through untyped.
		let values = values
			.into_iter()
			.map(|v| Value::Text(String::from_utf8_lossy(&v.bytes).into_owned()))
			.collect();
		return Ok(Some((name, RecordValue::Many(values))));
	};
	let mut decoded = Vec::with_capacity(values.len());
	for value in values {
		let decoded_value = match info.decoder {
			Some(decoder) => decoder.decode(value.text.as_deref(), &value.bytes).map_err(
				|source| Error::Decode { dn: dn.to_owned(), attribute: name.clone(), source },
			)?,
			None => Value::Text(match value.text {
				Some(text) => text,
				None => String::from_utf8_lossy(&value.bytes).into_owned(),
			}),
		};
		decoded.push(decoded_value);
	}
	let normalized = if info.single_valued {
		match decoded.len() {
			1 => RecordValue::One(decoded.remove(0)),
			0 => {
				return Err(Error::entry(dn, format!("single-valued {name:?} arrived empty")));
			}
			n => {
				return Err(Error::entry(
					dn,
					format!("single-valued {name:?} arrived with {n} values"),
				));
			}
		}
	} else {
		RecordValue::Many(decoded)
	};
	Ok(Some((name, normalized)))
}

/// Split `<attr>;range=<from>-<to>` into its parts; `<to>` is `None` for
/// the final (`*`) chunk. Returns `None` for names without a range marker.
pub(crate) fn parse_range_name(name: &str) -> Option<(&str, u64, Option<u64>)> {
	let (base, range) = name.split_once(";range=")?;
	if base.is_empty() {
		return None;
	}
	let (from, to) = range.split_once('-')?;
	let from = from.parse().ok()?;
	let to = if to == "*" { None } else { Some(to.parse().ok()?) };
	Some((base, from, to))
}

/// Accumulator for reassembling a range-limited multi-valued attribute.
///
/// The server delivers each chunk in reverse order relative to the range
/// indexing, so every chunk is reversed before concatenation. Follow-up
/// chunks are requested [`RANGE_OVERLAP`] values early; the overlapping
/// region must match the accumulated tail byte-for-byte, both as parsed
/// text and as raw bytes.
#[derive(Debug)]
pub(crate) struct RangeAssembly {
	values: Vec<RawValue>,
	/// Upper bound of the last chunk; `None` once the final chunk arrived.
	upper: Option<u64>,
}

impl RangeAssembly {
	pub(crate) fn begin(to: Option<u64>, mut chunk: Vec<RawValue>) -> Self {
		chunk.reverse();
		RangeAssembly { values: chunk, upper: to }
	}

	pub(crate) fn is_complete(&self) -> bool {
		self.upper.is_none()
	}

	/// The `<from>` offset to request for the next chunk.
	pub(crate) fn next_offset(&self) -> u64 {
		(self.values.len() - self.values.len().min(RANGE_OVERLAP)) as u64
	}

	/// Fold in the next chunk, verifying the overlap region.
	pub(crate) fn append(
		&mut self,
		from: u64,
		to: Option<u64>,
		mut chunk: Vec<RawValue>,
	) -> Result<(), String> {
		if from != self.next_offset() {
			return Err(format!("chunk starts at {from} where {} was requested", self.next_offset()));
		}
		chunk.reverse();
		let overlap = self.values.len() - from as usize;
		if chunk.len() < overlap {
			return Err("chunk is shorter than the verification overlap".to_owned());
		}
		if chunk[..overlap] != self.values[self.values.len() - overlap..] {
			return Err("overlap mismatch: re-fetched values differ from accumulated tail".to_owned());
		}
		if to.is_some() && chunk.len() == overlap {
			return Err("range did not advance".to_owned());
		}
		self.values.extend(chunk.into_iter().skip(overlap));
		self.upper = to;
		Ok(())
	}

	pub(crate) fn into_values(self) -> Vec<RawValue> {
		self.values
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::collections::{HashMap, HashSet};

	use ldap3::SearchEntry;

	use super::{
		collect_raw, normalize_attribute, parse_range_name, NormalizeContext, RangeAssembly,
		RawValue, RecordValue,
	};
	use crate::{
		decode::{Decoder, Value},
		error::Error,
		schema::AttributeInfo,
	};

	fn schema_fixture() -> HashMap<String, AttributeInfo> {
		HashMap::from([
			(
				"cn".to_owned(),
				AttributeInfo { single_valued: true, boolean: false, decoder: None },
			),
			(
				"member".to_owned(),
				AttributeInfo { single_valued: false, boolean: false, decoder: None },
			),
			(
				"objectGUID".to_owned(),
				AttributeInfo { single_valued: true, boolean: false, decoder: Some(Decoder::Guid) },
			),
			(
				"distinguishedName".to_owned(),
				AttributeInfo { single_valued: true, boolean: false, decoder: None },
			),
		])
	}

	fn normalize(
		name: &str,
		values: Vec<RawValue>,
		requested: &[&str],
	) -> Result<Option<(String, RecordValue)>, Error> {
		let schema = schema_fixture();
		let requested: HashSet<String> = requested.iter().map(|s| (*s).to_owned()).collect();
		let ctx = NormalizeContext {
			schema: &schema,
			requested: Some(&requested),
			keep_dn: requested.contains("distinguishedName"),
			strict: true,
		};
		normalize_attribute("cn=x,dc=example,dc=org", name.to_owned(), values, ctx)
	}

	#[test]
	fn single_valued_becomes_scalar() {
		let (name, value) =
			normalize("cn", vec![RawValue::text("Jane".to_owned())], &["cn"]).unwrap().unwrap();
		assert_eq!(name, "cn");
		assert_eq!(value, RecordValue::One(Value::Text("Jane".to_owned())));
	}

	#[test]
	fn multi_valued_stays_a_list() {
		let values = vec![RawValue::text("cn=a".to_owned()), RawValue::text("cn=b".to_owned())];
		let (_, value) = normalize("member", values, &["member"]).unwrap().unwrap();
		assert_eq!(
			value,
			RecordValue::Many(vec![
				Value::Text("cn=a".to_owned()),
				Value::Text("cn=b".to_owned())
			])
		);

		let (_, value) = normalize("member", vec![], &["member"]).unwrap().unwrap();
		assert_eq!(value, RecordValue::Many(vec![]), "empty lists are fine for multi-valued");
	}

	#[test]
	fn single_valued_with_several_values_is_an_error() {
		let values = vec![RawValue::text("a".to_owned()), RawValue::text("b".to_owned())];
		let err = normalize("cn", values, &["cn"]).unwrap_err();
		assert!(matches!(err, Error::Entry { .. }));
	}

	#[test]
	fn decoder_applies_to_binary_values() {
		let raw = vec![147, 123, 243, 42, 224, 235, 66, 224, 186, 238, 188, 8, 115, 89, 136, 214];
		let (_, value) =
			normalize("objectGUID", vec![RawValue::binary(raw)], &["objectGUID"]).unwrap().unwrap();
		assert_eq!(
			value,
			RecordValue::One(Value::Text("{2AF37B93-EBE0-E042-BAEE-BC08735988D6}".to_owned()))
		);
	}

	#[test]
	fn unselected_attribute_is_refused() {
		let err = normalize("member", vec![RawValue::text("x".to_owned())], &["cn"]).unwrap_err();
		assert!(matches!(err, Error::Entry { .. }));
	}

	#[test]
	fn implicit_dn_is_stripped_unless_selected() {
		let dn_value = vec![RawValue::text("cn=x,dc=example,dc=org".to_owned())];
		assert!(normalize("distinguishedName", dn_value.clone(), &["cn"]).unwrap().is_none());
		assert!(normalize("distinguishedName", dn_value, &["cn", "distinguishedName"])
			.unwrap()
			.is_some());
	}

	#[test]
	fn unknown_attribute_strict_vs_lenient() {
		let schema = schema_fixture();
		let strict = NormalizeContext { schema: &schema, requested: None, keep_dn: true, strict: true };
		let err = normalize_attribute(
			"cn=x",
			"mystery".to_owned(),
			vec![RawValue::text("v".to_owned())],
			strict,
		)
		.unwrap_err();
		assert!(matches!(err, Error::Entry { .. }));

		let lenient = NormalizeContext { strict: false, ..strict };
		let (_, value) = normalize_attribute(
			"cn=x",
			"mystery".to_owned(),
			vec![RawValue::text("v".to_owned())],
			lenient,
		)
		.unwrap()
		.unwrap();
		assert_eq!(value, RecordValue::Many(vec![Value::Text("v".to_owned())]));
	}

	#[test]
	fn collect_raw_merges_maps_and_skips_pseudo_attributes() {
		let entry = SearchEntry {
			dn: "cn=x,dc=example,dc=org".to_owned(),
			attrs: HashMap::from([
				("cn".to_owned(), vec!["Jane".to_owned()]),
				("controls".to_owned(), vec![]),
				("dn".to_owned(), vec!["cn=x".to_owned()]),
			]),
			bin_attrs: HashMap::from([("objectGUID".to_owned(), vec![vec![1; 16]])]),
		};
		let (dn, raw) = collect_raw(entry);
		assert_eq!(dn, "cn=x,dc=example,dc=org");
		let names: Vec<&str> = raw.iter().map(|(name, _)| name.as_str()).collect();
		assert_eq!(raw.len(), 2);
		assert!(names.contains(&"cn") && names.contains(&"objectGUID"));
	}

	#[test]
	fn range_names_parse() {
		assert_eq!(parse_range_name("member;range=0-1499"), Some(("member", 0, Some(1499))));
		assert_eq!(parse_range_name("member;range=1500-*"), Some(("member", 1500, None)));
		assert_eq!(parse_range_name("member"), None);
		assert_eq!(parse_range_name("member;range=x-12"), None);
		assert_eq!(parse_range_name(";range=0-1"), None);
	}

	fn chunk(range: std::ops::Range<u64>) -> Vec<RawValue> {
		// Chunks arrive newest-first relative to the range indexing.
		range.rev().map(|i| RawValue::text(format!("cn=m{i}"))).collect()
	}

	#[test]
	fn range_assembly_reverses_and_joins_chunks() {
		let mut assembly = RangeAssembly::begin(Some(14), chunk(0..15));
		assert!(!assembly.is_complete());
		assert_eq!(assembly.next_offset(), 5);
		assembly.append(5, None, chunk(5..23)).unwrap();
		assert!(assembly.is_complete());
		let values = assembly.into_values();
		assert_eq!(values.len(), 23);
		assert_eq!(values[0], RawValue::text("cn=m0".to_owned()));
		assert_eq!(values[22], RawValue::text("cn=m22".to_owned()));
	}

	#[test]
	fn range_assembly_rejects_overlap_mismatch() {
		let mut assembly = RangeAssembly::begin(Some(14), chunk(0..15));
		let mut bad = chunk(5..23);
		// Corrupt a value inside the verification overlap.
		let last = bad.len() - 1;
		bad[last] = RawValue::text("cn=intruder".to_owned());
		assert!(assembly.append(5, None, bad).unwrap_err().contains("overlap mismatch"));
	}

	#[test]
	fn range_assembly_rejects_wrong_offset_and_stalls() {
		let mut assembly = RangeAssembly::begin(Some(14), chunk(0..15));
		assert!(assembly.append(7, None, chunk(7..20)).is_err(), "offset must match the request");

		let mut assembly = RangeAssembly::begin(Some(14), chunk(0..15));
		assert!(
			assembly.append(5, Some(14), chunk(5..15)).is_err(),
			"a chunk that adds nothing but claims more data is a stall"
		);
	}
}
