use crate::error::MtdbError;
use crate::model::{AttributeValue, KeyType};
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use compact_str::CompactString;

/// Encodes `(tenant, virtual table, hash-key value)` into the composite
/// string stored in a shared physical hash key, and decodes it back.
///
/// Each segment is escaped so that the delimiter never appears unescaped
/// inside it, which makes the encoding injective: distinct triples always
/// produce distinct strings and `decode(encode(x)) == x`.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    delimiter: char,
    table_prefix: Option<String>,
}

/// The triple recovered from a composite physical hash key. The value stays
/// in its canonical textual form; use [`KeyCodec::value_from_text`] to get a
/// typed value back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKey {
    pub tenant_id: CompactString,
    pub table_name: CompactString,
    pub value_text: CompactString,
}

impl KeyCodec {
    pub fn new(delimiter: char, table_prefix: Option<String>) -> Self {
        debug_assert!(delimiter.is_ascii(), "delimiter must be ascii");
        Self {
            delimiter,
            table_prefix,
        }
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    /// Composite key for a typed hash-key value.
    pub fn encode(
        &self,
        tenant_id: &str,
        table_name: &str,
        value: &AttributeValue,
    ) -> Result<CompactString, MtdbError> {
        Ok(self.encode_text(tenant_id, table_name, &canonical_text(value)?))
    }

    /// Composite key for a value already in canonical textual form.
    pub fn encode_text(&self, tenant_id: &str, table_name: &str, value_text: &str) -> CompactString {
        let mut out = self.encode_prefix(tenant_id, table_name);
        out.push_str(&escape_segment(value_text, self.delimiter));
        out
    }

    /// The tenant-qualified prefix of a virtual table, ending in the
    /// delimiter. Every composite key of that table starts with it.
    pub fn encode_prefix(&self, tenant_id: &str, table_name: &str) -> CompactString {
        let prefixed_table = match &self.table_prefix {
            Some(prefix) => format!("{prefix}{table_name}"),
            None => table_name.to_string(),
        };
        let mut out = CompactString::default();
        out.push_str(&escape_segment(tenant_id, self.delimiter));
        out.push(self.delimiter);
        out.push_str(&escape_segment(&prefixed_table, self.delimiter));
        out.push(self.delimiter);
        out
    }

    pub fn decode(&self, physical: &str) -> Result<DecodedKey, MtdbError> {
        let malformed = |reason: &str| MtdbError::MalformedPhysicalKey {
            key: physical.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = physical.split(self.delimiter);
        let (tenant, table, value) = match (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) {
            (Some(tenant), Some(table), Some(value), None) => (tenant, table, value),
            _ => return Err(malformed("expected exactly two delimiters")),
        };

        let tenant_id = unescape_segment(tenant).ok_or_else(|| malformed("bad tenant escape"))?;
        let table = unescape_segment(table).ok_or_else(|| malformed("bad table escape"))?;
        let value_text = unescape_segment(value).ok_or_else(|| malformed("bad value escape"))?;

        let table_name = match &self.table_prefix {
            Some(prefix) => table
                .strip_prefix(prefix.as_str())
                .ok_or_else(|| malformed("table prefix mismatch"))?
                .into(),
            None => table,
        };

        Ok(DecodedKey {
            tenant_id,
            table_name,
            value_text,
        })
    }
}

/// Canonical textual form of a key value: `S` as-is, `N` the exact numeric
/// lexeme, `B` standard base64 without padding.
pub fn canonical_text(value: &AttributeValue) -> Result<CompactString, MtdbError> {
    match value {
        AttributeValue::S(s) => Ok(s.clone()),
        AttributeValue::N(n) => Ok(n.clone()),
        AttributeValue::B(b) => Ok(STANDARD_NO_PAD.encode(b).into()),
        other => Err(MtdbError::Validation(format!(
            "value of type {} cannot be a key",
            other.type_tag()
        ))),
    }
}

/// Inverse of [`canonical_text`] for a known key type.
pub fn value_from_text(text: &str, key_type: KeyType) -> Result<AttributeValue, MtdbError> {
    match key_type {
        KeyType::S => Ok(AttributeValue::s(text)),
        KeyType::N => Ok(AttributeValue::n(text)),
        KeyType::B => STANDARD_NO_PAD
            .decode(text)
            .map(AttributeValue::B)
            .map_err(|e| MtdbError::Validation(format!("bad base64 key value: {e}"))),
    }
}

/// Percent-escapes `%` and the delimiter. Character-wise, so escaping
/// preserves the prefix relation (needed for `begins_with` rewriting).
pub(crate) fn escape_segment(segment: &str, delimiter: char) -> CompactString {
    let mut out = CompactString::default();
    for c in segment.chars() {
        if c == '%' || c == delimiter {
            out.push('%');
            out.push_str(&format!("{:02X}", c as u32));
        } else {
            out.push(c);
        }
    }
    out
}

pub(crate) fn unescape_segment(segment: &str) -> Option<CompactString> {
    let mut out = CompactString::default();
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hi = chars.next()?;
            let lo = chars.next()?;
            let code = u32::from_str_radix(&format!("{hi}{lo}"), 16).ok()?;
            out.push(char::from_u32(code)?);
        } else {
            out.push(c);
        }
    }
    Some(out)
}
