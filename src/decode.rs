//! Decoders that turn raw attribute bytes into typed values.
//!
//! Active Directory delivers every attribute as text or raw bytes; which
//! decoder applies is learnt from the attribute schema (see
//! [`crate::schema`]). Each decoder receives both the transport-parsed text
//! (when the value was valid UTF-8) and the raw bytes, so byte-oriented
//! formats like SIDs and GUIDs work regardless of how the transport
//! classified the value.

use serde::Serialize;
use time::{macros::format_description, OffsetDateTime, PrimitiveDateTime};

/// How timestamps and parsed generalized-time values are rendered.
const DISPLAY_FORMAT: &[time::format_description::FormatItem] =
	format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// The date/time core of an AD GeneralizedTime value, e.g. `20130516200520`.
/// Fractional seconds and the zone designator are validated separately.
const GENERALIZED_FORMAT: &[time::format_description::FormatItem] =
	format_description!("[year][month][day][hour][minute][second]");

/// Milliseconds between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_OFFSET_MILLIS: i128 = 11_644_473_600_000;

/// Windows-NT filetime value used by AD to mean "never".
const FILETIME_NEVER: i64 = i64::MAX;

/// A decoded attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
	/// Absent or sentinel value (e.g. an empty integer, or a filetime that
	/// means "never").
	Null,
	/// A boolean attribute value.
	Bool(bool),
	/// An integer attribute value.
	Integer(i64),
	/// Everything else, including formatted timestamps, SIDs and GUIDs.
	Text(String),
}

impl Value {
	/// Borrow the textual form, if this is a [`Value::Text`].
	#[must_use]
	pub fn as_str(&self) -> Option<&str> {
		match self {
			Value::Text(text) => Some(text),
			_ => None,
		}
	}

	/// Get the boolean, if this is a [`Value::Bool`].
	#[must_use]
	pub fn as_bool(&self) -> Option<bool> {
		match self {
			Value::Bool(value) => Some(*value),
			_ => None,
		}
	}

	/// Get the integer, if this is a [`Value::Integer`].
	#[must_use]
	pub fn as_integer(&self) -> Option<i64> {
		match self {
			Value::Integer(value) => Some(*value),
			_ => None,
		}
	}
}

/// Errors produced while decoding a single attribute value.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
	/// A boolean attribute held something other than `TRUE` or `FALSE`.
	#[error("expected TRUE or FALSE, got {0:?}")]
	NotBoolean(String),
	/// A text-based decoder received bytes that are not valid UTF-8.
	#[error("value is not valid UTF-8")]
	NotText,
	/// An integer attribute failed to parse.
	#[error("invalid integer {0:?}")]
	NotInteger(String),
	/// A filetime or generalized-time value failed to parse.
	#[error("invalid timestamp {0:?}")]
	BadTimestamp(String),
	/// A GUID value was not exactly 16 bytes.
	#[error("GUID must be 16 bytes, got {0}")]
	BadGuidLength(usize),
	/// A SID did not start with revision 1.
	#[error("SID revision must be 1, got {0}")]
	BadSidRevision(u8),
	/// A SID's length did not match its sub-authority count.
	#[error("SID of {actual} bytes does not fit {count} sub-authorities")]
	BadSidLength {
		/// Observed byte length.
		actual: usize,
		/// Sub-authority count from the header byte.
		count: usize,
	},
}

/// The decoders an attribute can be assigned during schema bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoder {
	/// `TRUE`/`FALSE` to [`Value::Bool`].
	Bool,
	/// Decimal text to [`Value::Integer`].
	Int32,
	/// Windows-NT filetime ticks to a formatted timestamp.
	FileTime,
	/// ASN.1 GeneralizedTime to a formatted timestamp.
	GeneralizedTime,
	/// 16 raw bytes to the braced, mixed-endian GUID form.
	Guid,
	/// Raw security-identifier bytes to the `S-1-…` form.
	Sid,
	/// Arbitrary bytes to spaced uppercase hex.
	OctetString,
}

impl Decoder {
	/// Decode one attribute value. `text` is the transport-parsed string
	/// when the value was valid UTF-8; `raw` is always the exact bytes the
	/// server sent.
	pub fn decode(self, text: Option<&str>, raw: &[u8]) -> Result<Value, DecodeError> {
		match self {
			Decoder::Bool => decode_bool(require_text(text)?),
			Decoder::Int32 => decode_int32(require_text(text)?),
			Decoder::FileTime => decode_file_time(require_text(text)?),
			Decoder::GeneralizedTime => decode_generalized_time(require_text(text)?),
			Decoder::Guid => decode_guid(raw),
			Decoder::Sid => decode_sid(raw),
			Decoder::OctetString => Ok(Value::Text(hex_spaced(raw))),
		}
	}
}

fn require_text(text: Option<&str>) -> Result<&str, DecodeError> {
	text.ok_or(DecodeError::NotText)
}

fn decode_bool(text: &str) -> Result<Value, DecodeError> {
	match text {
		"TRUE" => Ok(Value::Bool(true)),
		"FALSE" => Ok(Value::Bool(false)),
		other => Err(DecodeError::NotBoolean(other.to_owned())),
	}
}

fn decode_int32(text: &str) -> Result<Value, DecodeError> {
	if text.is_empty() {
		return Ok(Value::Null);
	}
	let parsed: i32 = text.parse().map_err(|_| DecodeError::NotInteger(text.to_owned()))?;
	Ok(Value::Integer(i64::from(parsed)))
}

/// Decode 100-nanosecond ticks since 1601-01-01 UTC.
///
/// The arithmetic is integer throughout, so even the largest directory
/// values keep full precision. The sentinels `0` and `i64::MAX`, which AD
/// uses for "never", decode to [`Value::Null`]. Output is rendered in UTC.
fn decode_file_time(text: &str) -> Result<Value, DecodeError> {
	let ticks: i64 = text.parse().map_err(|_| DecodeError::BadTimestamp(text.to_owned()))?;
	if ticks == 0 || ticks == FILETIME_NEVER {
		return Ok(Value::Null);
	}
	if ticks < 0 {
		return Err(DecodeError::BadTimestamp(text.to_owned()));
	}
	let millis = i128::from(ticks / 10_000) - FILETIME_UNIX_OFFSET_MILLIS;
	let timestamp = OffsetDateTime::from_unix_timestamp_nanos(millis * 1_000_000)
		.map_err(|_| DecodeError::BadTimestamp(text.to_owned()))?;
	let formatted =
		timestamp.format(&DISPLAY_FORMAT).map_err(|_| DecodeError::BadTimestamp(text.to_owned()))?;
	Ok(Value::Text(formatted))
}

/// Decode `YYYYMMDDhhmmss[.f][Z]` as delivered for GeneralizedTime syntax.
fn decode_generalized_time(text: &str) -> Result<Value, DecodeError> {
	let bad = || DecodeError::BadTimestamp(text.to_owned());
	let head = text.get(..14).ok_or_else(bad)?;
	let rest = &text[14..];
	// Whatever follows the seconds must be a fraction, a zone, or nothing.
	if !(rest.is_empty()
		|| rest == "Z"
		|| (rest.starts_with('.')
			&& rest.ends_with('Z')
			&& rest[1..rest.len() - 1].bytes().all(|b| b.is_ascii_digit())))
	{
		return Err(bad());
	}
	let parsed = PrimitiveDateTime::parse(head, &GENERALIZED_FORMAT).map_err(|_| bad())?;
	let formatted = parsed.format(&DISPLAY_FORMAT).map_err(|_| bad())?;
	Ok(Value::Text(formatted))
}

/// Format 16 raw bytes as `{xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx}`.
///
/// The first three fields are stored little-endian on the wire, so their
/// bytes are swapped into display order; the last eight bytes print as-is.
fn decode_guid(raw: &[u8]) -> Result<Value, DecodeError> {
	if raw.len() != 16 {
		return Err(DecodeError::BadGuidLength(raw.len()));
	}
	Ok(Value::Text(format!(
		"{{{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}}}",
		raw[3],
		raw[2],
		raw[1],
		raw[0],
		raw[5],
		raw[4],
		raw[7],
		raw[6],
		raw[8],
		raw[9],
		raw[10],
		raw[11],
		raw[12],
		raw[13],
		raw[14],
		raw[15],
	)))
}

/// Format a binary security identifier as `S-<rev>-<authority>-<sa>…`.
///
/// Layout (MS-DTYP 2.4.2): revision byte, sub-authority count byte, 48-bit
/// big-endian identifier authority, then one little-endian `u32` per
/// sub-authority. The length must match the count exactly.
fn decode_sid(raw: &[u8]) -> Result<Value, DecodeError> {
	if raw.len() < 8 {
		return Err(DecodeError::BadSidLength { actual: raw.len(), count: 0 });
	}
	let revision = raw[0];
	if revision != 1 {
		return Err(DecodeError::BadSidRevision(revision));
	}
	let count = usize::from(raw[1]);
	if raw.len() != 8 + 4 * count {
		return Err(DecodeError::BadSidLength { actual: raw.len(), count });
	}
	let authority =
		u64::from_be_bytes([0, 0, raw[2], raw[3], raw[4], raw[5], raw[6], raw[7]]);
	let mut sid = format!("S-{revision}-{authority}");
	for chunk in raw[8..].chunks_exact(4) {
		let sub = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
		sid.push('-');
		sid.push_str(&sub.to_string());
	}
	Ok(Value::Text(sid))
}

fn hex_spaced(raw: &[u8]) -> String {
	let mut out = String::with_capacity(raw.len() * 3);
	for (i, byte) in raw.iter().enumerate() {
		if i > 0 {
			out.push(' ');
		}
		out.push_str(&format!("{byte:02X}"));
	}
	out
}
