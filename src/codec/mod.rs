//! Conversion between native table items and portable records.
//!
//! A record is a plain JSON object: field names mapped to dynamically typed
//! values (string, number, boolean, null, nested object or array). Records
//! round-trip through encode → serialize → deserialize → decode without
//! losing field identity or primitive types.

use bytes::Bytes;
use snafu::prelude::*;
use std::collections::HashMap;

use aws_sdk_dynamodb::types::AttributeValue;

use crate::error::{CodecError, EncodeItemSnafu, DecodeRecordSnafu, PageSerializeSnafu};

/// Native table item representation.
pub type Item = HashMap<String, AttributeValue>;

/// A portable record: one table item in interchange form.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Encode a native item into a portable record.
pub fn encode_item(item: Item) -> Result<Record, CodecError> {
    serde_dynamo::from_item(item).context(EncodeItemSnafu)
}

/// Decode a portable record back into a native item.
pub fn decode_record(record: Record) -> Result<Item, CodecError> {
    serde_dynamo::to_item(record).context(DecodeRecordSnafu)
}

/// Serialize one page of records as a JSON array followed by a newline.
///
/// The archived object is a plain sequence of such arrays; there is no
/// top-level envelope or end marker beyond stream EOF.
pub fn serialize_page(records: &[Record]) -> Result<Bytes, CodecError> {
    let mut buf = serde_json::to_vec(records).context(PageSerializeSnafu)?;
    buf.push(b'\n');
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nested_item() -> Item {
        HashMap::from([
            ("id".to_string(), AttributeValue::S("user-1".into())),
            ("age".to_string(), AttributeValue::N("42".into())),
            ("score".to_string(), AttributeValue::N("3.5".into())),
            ("active".to_string(), AttributeValue::Bool(true)),
            ("nickname".to_string(), AttributeValue::Null(true)),
            (
                "address".to_string(),
                AttributeValue::M(HashMap::from([
                    ("city".to_string(), AttributeValue::S("Melbourne".into())),
                    ("postcode".to_string(), AttributeValue::N("3000".into())),
                ])),
            ),
            (
                "tags".to_string(),
                AttributeValue::L(vec![
                    AttributeValue::S("a".into()),
                    AttributeValue::N("7".into()),
                ]),
            ),
        ])
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let item = nested_item();
        let record = encode_item(item.clone()).unwrap();
        let decoded = decode_record(record).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn test_encode_preserves_types() {
        let record = encode_item(nested_item()).unwrap();
        assert_eq!(record["id"], json!("user-1"));
        assert_eq!(record["age"], json!(42));
        assert_eq!(record["score"], json!(3.5));
        assert_eq!(record["active"], json!(true));
        assert_eq!(record["nickname"], serde_json::Value::Null);
        assert_eq!(record["address"]["postcode"], json!(3000));
        assert_eq!(record["tags"], json!(["a", 7]));
    }

    #[test]
    fn test_serialize_page_is_newline_terminated_array() {
        let records: Vec<Record> = (0..3)
            .map(|i| {
                let mut record = Record::new();
                record.insert("n".into(), json!(i));
                record
            })
            .collect();

        let bytes = serialize_page(&records).unwrap();
        assert!(bytes.ends_with(b"\n"));

        let parsed: Vec<Record> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, records);
    }

    #[test]
    fn test_round_trip_through_serialized_page() {
        let item = nested_item();
        let record = encode_item(item.clone()).unwrap();
        let bytes = serialize_page(std::slice::from_ref(&record)).unwrap();

        let parsed: Vec<Record> = serde_json::from_slice(&bytes).unwrap();
        let decoded = decode_record(parsed.into_iter().next().unwrap()).unwrap();
        assert_eq!(decoded, item);
    }
}
