// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Field-name codec.
//!
//! Document stores reserve '.' (sub-document path) and '$' (operator
//! prefix) in field names. Caller field names are mapped onto substitute
//! code points before storage and mapped back on every read:
//!
//! | caller | stored  |
//! |--------|---------|
//! | `.`    | U+FF0E  |
//! | `$`    | U+FF04  |
//!
//! The mapping is a bijection for any field name that does not already
//! contain U+FF0E or U+FF04.

use crate::Record;

const DOT: char = '.';
const DOLLAR: char = '$';
const STORED_DOT: char = '\u{FF0E}';
const STORED_DOLLAR: char = '\u{FF04}';

#[must_use]
pub fn encode_field(field: &str) -> String {
    if !field.contains([DOT, DOLLAR]) {
        return field.to_string();
    }
    field
        .chars()
        .map(|c| match c {
            DOT => STORED_DOT,
            DOLLAR => STORED_DOLLAR,
            other => other,
        })
        .collect()
}

#[must_use]
pub fn decode_field(stored: &str) -> String {
    if !stored.contains([STORED_DOT, STORED_DOLLAR]) {
        return stored.to_string();
    }
    stored
        .chars()
        .map(|c| match c {
            STORED_DOT => DOT,
            STORED_DOLLAR => DOLLAR,
            other => other,
        })
        .collect()
}

/// Encode a list of field names, dropping empty ones.
#[must_use]
pub fn encode_fields<S: AsRef<str>>(fields: &[S]) -> Vec<String> {
    fields
        .iter()
        .map(AsRef::as_ref)
        .filter(|f| !f.is_empty())
        .map(encode_field)
        .collect()
}

/// Encode every field name of a record for storage. Entries with an empty
/// field name are dropped.
#[must_use]
pub fn serialize_record(record: &Record) -> Record {
    record
        .iter()
        .filter(|(field, _)| !field.is_empty())
        .map(|(field, value)| (encode_field(field), value.clone()))
        .collect()
}

/// Decode every field name of a stored document.
#[must_use]
pub fn deserialize_record(stored: Record) -> Record {
    stored
        .into_iter()
        .map(|(field, value)| (decode_field(&field), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_plain_fields_unchanged() {
        assert_eq!(encode_field("name"), "name");
        assert_eq!(decode_field("name"), "name");
    }

    #[test]
    fn test_reserved_characters_replaced() {
        let stored = encode_field("a.b$c");
        assert!(!stored.contains('.'));
        assert!(!stored.contains('$'));
        assert_eq!(stored, "a\u{FF0E}b\u{FF04}c");
        assert_eq!(decode_field(&stored), "a.b$c");
    }

    #[test]
    fn test_encode_fields_drops_empty() {
        assert_eq!(encode_fields(&["", "x.y"]), vec!["x\u{FF0E}y".to_string()]);
    }

    #[test]
    fn test_serialize_record_drops_empty_field_names() {
        let record = json!({"": 1, "ok": 2}).as_object().cloned().unwrap();
        let stored = serialize_record(&record);
        assert_eq!(Value::Object(stored), json!({"ok": 2}));
    }

    #[test]
    fn test_record_round_trip() {
        let record = json!({"user.name": "Ann", "$price": 3, "plain": [1, 2]})
            .as_object()
            .cloned()
            .unwrap();
        let stored = serialize_record(&record);
        assert!(stored.keys().all(|k| !k.contains('.') && !k.starts_with('$')));
        assert_eq!(deserialize_record(stored), record);
    }
}
