//! Filter expressions and their compilation to RFC 2254 wire strings.
//!
//! Filters are built either from the typed [`Filter`] tree or from the
//! tagged-sequence JSON form (`["and", ["equals", "cn", "foo"], …]`) via
//! [`Filter::from_json`]. Compilation validates every node (attribute
//! shape, value length, boolean attribute rules) and escapes all values, so
//! a compiled filter is injection-safe by construction.
//!
//! The two virtual attributes [`TRANSITIVE_MEMBER`] and
//! [`TRANSITIVE_MEMBER_OF`] denote in-chain group membership. They are
//! normally expanded client-side before compilation (see
//! [`crate::transitive`]); if one reaches the compiler it is emitted in the
//! server-side matching-rule form instead.

use std::collections::HashSet;

use crate::error::Error;

/// Virtual attribute matching objects that have a DN among their in-chain
/// members.
pub const TRANSITIVE_MEMBER: &str = "_transitive_member";

/// Virtual attribute matching objects that are in-chain members of a DN.
pub const TRANSITIVE_MEMBER_OF: &str = "_transitive_memberOf";

/// The LDAP_MATCHING_RULE_IN_CHAIN extensible-match OID.
const MATCHING_RULE_IN_CHAIN: &str = "1.2.840.113556.1.4.1941";

/// Longest accepted attribute value, in characters.
const VALUE_MAX: usize = 255;

/// A search filter expression.
///
/// Each variant corresponds to one operation of the filter language; the
/// children carry exactly the operands that operation takes.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
	/// All subexpressions must match. Requires at least one child.
	And(Vec<Filter>),
	/// At least one subexpression must match. Requires at least one child.
	Or(Vec<Filter>),
	/// The subexpression must not match.
	Not(Box<Filter>),
	/// The attribute equals the value.
	Equals(String, String),
	/// The attribute starts with the value.
	BeginsWith(String, String),
	/// The attribute ends with the value.
	EndsWith(String, String),
	/// The attribute contains the value.
	Contains(String, String),
	/// The attribute is present, with any value.
	Has(String),
	/// The attribute equals one of the values. An empty list matches
	/// nothing.
	OneOf(String, Vec<String>),
	/// Matches every object.
	True,
	/// Matches no object.
	False,
}

impl Filter {
	/// Conjunction of the given subexpressions.
	#[must_use]
	pub fn and(children: Vec<Filter>) -> Self {
		Filter::And(children)
	}

	/// Disjunction of the given subexpressions.
	#[must_use]
	pub fn or(children: Vec<Filter>) -> Self {
		Filter::Or(children)
	}

	/// Negation of the given subexpression.
	#[must_use]
	pub fn not(child: Filter) -> Self {
		Filter::Not(Box::new(child))
	}

	/// Equality match.
	#[must_use]
	pub fn equals(attribute: impl Into<String>, value: impl Into<String>) -> Self {
		Filter::Equals(attribute.into(), value.into())
	}

	/// Prefix match.
	#[must_use]
	pub fn begins_with(attribute: impl Into<String>, value: impl Into<String>) -> Self {
		Filter::BeginsWith(attribute.into(), value.into())
	}

	/// Suffix match.
	#[must_use]
	pub fn ends_with(attribute: impl Into<String>, value: impl Into<String>) -> Self {
		Filter::EndsWith(attribute.into(), value.into())
	}

	/// Substring match.
	#[must_use]
	pub fn contains(attribute: impl Into<String>, value: impl Into<String>) -> Self {
		Filter::Contains(attribute.into(), value.into())
	}

	/// Presence match.
	#[must_use]
	pub fn has(attribute: impl Into<String>) -> Self {
		Filter::Has(attribute.into())
	}

	/// Membership in a list of values.
	#[must_use]
	pub fn one_of(attribute: impl Into<String>, values: Vec<String>) -> Self {
		Filter::OneOf(attribute.into(), values)
	}

	/// Parse the tagged-sequence JSON form, e.g.
	/// `["and", ["equals", "cn", "foo"], ["has", "mail"]]`.
	///
	/// This validates the shape of every node: known tag, correct arity,
	/// strings where strings are required, and a list of strings as the
	/// third element of `oneof`. Attribute names and value lengths are
	/// checked later, by [`Filter::compile`].
	pub fn from_json(value: &serde_json::Value) -> Result<Self, Error> {
		let node = value
			.as_array()
			.filter(|items| !items.is_empty())
			.ok_or_else(|| Error::Filter(format!("expected a nonempty sequence, got {value}")))?;
		let tag = node[0]
			.as_str()
			.ok_or_else(|| Error::Filter(format!("expected a string tag, got {}", node[0])))?;
		let arity = |expected: usize| {
			if node.len() == expected + 1 {
				Ok(())
			} else {
				Err(Error::Filter(format!(
					"{tag:?} takes {expected} operands, got {}",
					node.len() - 1
				)))
			}
		};
		let string_at = |index: usize| {
			node[index]
				.as_str()
				.map(str::to_owned)
				.ok_or_else(|| Error::Filter(format!("{tag:?} operands must be strings")))
		};
		match tag {
			"and" | "or" => {
				if node.len() < 2 {
					return Err(Error::Filter(format!("{tag:?} takes at least one operand")));
				}
				let children =
					node[1..].iter().map(Filter::from_json).collect::<Result<Vec<_>, _>>()?;
				Ok(if tag == "and" { Filter::And(children) } else { Filter::Or(children) })
			}
			"not" => {
				arity(1)?;
				Ok(Filter::not(Filter::from_json(&node[1])?))
			}
			"equals" => {
				arity(2)?;
				Ok(Filter::Equals(string_at(1)?, string_at(2)?))
			}
			"beginswith" => {
				arity(2)?;
				Ok(Filter::BeginsWith(string_at(1)?, string_at(2)?))
			}
			"endswith" => {
				arity(2)?;
				Ok(Filter::EndsWith(string_at(1)?, string_at(2)?))
			}
			"contains" => {
				arity(2)?;
				Ok(Filter::Contains(string_at(1)?, string_at(2)?))
			}
			"has" => {
				arity(1)?;
				Ok(Filter::Has(string_at(1)?))
			}
			"oneof" => {
				arity(2)?;
				let values = node[2]
					.as_array()
					.ok_or_else(|| {
						Error::Filter(format!("\"oneof\" values must be a list, got {}", node[2]))
					})?
					.iter()
					.map(|v| {
						v.as_str()
							.map(str::to_owned)
							.ok_or_else(|| Error::Filter("\"oneof\" values must be strings".into()))
					})
					.collect::<Result<Vec<_>, _>>()?;
				Ok(Filter::OneOf(string_at(1)?, values))
			}
			"true" => {
				arity(0)?;
				Ok(Filter::True)
			}
			"false" => {
				arity(0)?;
				Ok(Filter::False)
			}
			other => Err(Error::Filter(format!("unknown filter tag {other:?}"))),
		}
	}

	/// Compile this expression to its RFC 2254 wire form.
	///
	/// `booleans` is the set of attributes with Boolean syntax; equality on
	/// them requires the literal values `TRUE`/`FALSE`, and substring
	/// operators reject them outright.
	///
	/// The walk is driven by an explicit work list, so nesting depth never
	/// translates into call-stack depth.
	pub fn compile(&self, booleans: &HashSet<String>) -> Result<String, Error> {
		enum Step<'a> {
			Node(&'a Filter),
			Close,
		}

		let mut out = String::new();
		let mut work = vec![Step::Node(self)];
		while let Some(step) = work.pop() {
			let filter = match step {
				Step::Close => {
					out.push(')');
					continue;
				}
				Step::Node(filter) => filter,
			};
			match filter {
				Filter::And(children) | Filter::Or(children) => {
					if children.is_empty() {
						return Err(Error::Filter(
							"\"and\"/\"or\" take at least one operand".into(),
						));
					}
					if let [only] = children.as_slice() {
						work.push(Step::Node(only));
						continue;
					}
					out.push('(');
					out.push(if matches!(filter, Filter::And(_)) { '&' } else { '|' });
					work.push(Step::Close);
					for child in children.iter().rev() {
						work.push(Step::Node(child));
					}
				}
				Filter::Not(child) => {
					out.push_str("(!");
					work.push(Step::Close);
					work.push(Step::Node(child));
				}
				Filter::Equals(attribute, value) => {
					write_equals(&mut out, attribute, value, booleans)?;
				}
				Filter::BeginsWith(attribute, value) => {
					write_substring(&mut out, attribute, value, booleans, Substring::Begins)?;
				}
				Filter::EndsWith(attribute, value) => {
					write_substring(&mut out, attribute, value, booleans, Substring::Ends)?;
				}
				Filter::Contains(attribute, value) => {
					write_substring(&mut out, attribute, value, booleans, Substring::Contains)?;
				}
				Filter::Has(attribute) => {
					check_attribute(attribute)?;
					out.push('(');
					out.push_str(attribute);
					out.push_str("=*)");
				}
				Filter::OneOf(attribute, values) => {
					if values.is_empty() {
						out.push_str("(!(objectClass=*))");
						continue;
					}
					if values.len() > 1 {
						out.push_str("(|");
					}
					for value in values {
						write_equals(&mut out, attribute, value, booleans)?;
					}
					if values.len() > 1 {
						out.push(')');
					}
				}
				Filter::True => out.push_str("(objectClass=*)"),
				Filter::False => out.push_str("(!(objectClass=*))"),
			}
		}
		Ok(out)
	}
}

#[derive(Clone, Copy)]
enum Substring {
	Begins,
	Ends,
	Contains,
}

fn write_equals(
	out: &mut String,
	attribute: &str,
	value: &str,
	booleans: &HashSet<String>,
) -> Result<(), Error> {
	check_value(attribute, value)?;
	if let Some(link) = virtual_link(attribute) {
		// Client-side expansion did not run; fall back to the server-side
		// in-chain matching rule.
		out.push('(');
		out.push_str(link);
		out.push(':');
		out.push_str(MATCHING_RULE_IN_CHAIN);
		out.push_str(":=");
		escape_value_into(out, value);
		out.push(')');
		return Ok(());
	}
	check_attribute(attribute)?;
	if booleans.contains(attribute) && value != "TRUE" && value != "FALSE" {
		return Err(Error::Filter(format!(
			"boolean attribute {attribute:?} can only be compared with TRUE or FALSE, got {value:?}"
		)));
	}
	out.push('(');
	out.push_str(attribute);
	out.push('=');
	escape_value_into(out, value);
	out.push(')');
	Ok(())
}

fn write_substring(
	out: &mut String,
	attribute: &str,
	value: &str,
	booleans: &HashSet<String>,
	kind: Substring,
) -> Result<(), Error> {
	check_attribute(attribute)?;
	check_value(attribute, value)?;
	if booleans.contains(attribute) {
		return Err(Error::Filter(format!(
			"boolean attribute {attribute:?} cannot be used in substring matches"
		)));
	}
	out.push('(');
	out.push_str(attribute);
	out.push('=');
	if matches!(kind, Substring::Ends | Substring::Contains) {
		out.push('*');
	}
	escape_value_into(out, value);
	if matches!(kind, Substring::Begins | Substring::Contains) {
		out.push('*');
	}
	out.push(')');
	Ok(())
}

/// The real link attribute behind a virtual transitive attribute, if
/// `attribute` is one.
pub(crate) fn virtual_link(attribute: &str) -> Option<&'static str> {
	match attribute {
		TRANSITIVE_MEMBER => Some("member"),
		TRANSITIVE_MEMBER_OF => Some("memberOf"),
		_ => None,
	}
}

/// Whether `name` is acceptable as a real (wire) attribute name: 2 to 60
/// characters, starting with a lowercase ASCII letter, continuing with
/// ASCII letters, digits or `-`.
pub(crate) fn is_valid_attribute_name(name: &str) -> bool {
	let bytes = name.as_bytes();
	(2..=60).contains(&bytes.len())
		&& bytes[0].is_ascii_lowercase()
		&& bytes[1..].iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}

fn check_attribute(name: &str) -> Result<(), Error> {
	if is_valid_attribute_name(name) {
		Ok(())
	} else {
		Err(Error::Filter(format!("invalid attribute name {name:?}")))
	}
}

fn check_value(attribute: &str, value: &str) -> Result<(), Error> {
	let length = value.chars().count();
	if length == 0 || length > VALUE_MAX {
		return Err(Error::Filter(format!(
			"value for {attribute:?} must be 1 to {VALUE_MAX} characters, got {length}"
		)));
	}
	Ok(())
}

/// Append `value` to `out` with the RFC 2254 escapes applied: `*`, `(`,
/// `)`, `\` and NUL become `\2a`, `\28`, `\29`, `\5c` and `\00`; every
/// other character, including multibyte UTF-8, passes through unchanged.
pub(crate) fn escape_value_into(out: &mut String, value: &str) {
	for c in value.chars() {
		match c {
			'*' => out.push_str("\\2a"),
			'(' => out.push_str("\\28"),
			')' => out.push_str("\\29"),
			'\\' => out.push_str("\\5c"),
			'\0' => out.push_str("\\00"),
			other => out.push(other),
		}
	}
}
