//! Encoder properties checked through the public API.

use pretty_assertions::assert_eq;
use serde_json::Value;
use sqljson_gateway::db::{FieldDescriptor, ResultSet};
use sqljson_gateway::encode::{encode, encode_into};
use sqljson_gateway::error::EncodeError;

fn grid(rows: usize, cols: usize) -> ResultSet {
    let fields = (0..cols)
        .map(|c| FieldDescriptor::new(format!("col{c}"), "VARCHAR"))
        .collect();
    let data = (0..rows)
        .map(|r| {
            (0..cols)
                .map(|c| {
                    if (r + c) % 3 == 0 {
                        None
                    } else {
                        Some(format!("r{r}c{c}").into_bytes())
                    }
                })
                .collect()
        })
        .collect();
    ResultSet::new(fields, data)
}

#[test]
fn test_output_is_valid_json_with_catalog_order() {
    let mut result = grid(4, 3);
    let document = encode(&mut result).unwrap();

    let parsed: Value = serde_json::from_str(document.as_str()).unwrap();
    let rows = parsed.as_array().unwrap();
    assert_eq!(rows.len(), 4);

    for (r, row) in rows.iter().enumerate() {
        let object = row.as_object().unwrap();
        assert_eq!(object.len(), 3);
        for c in 0..3 {
            let value = &object[&format!("col{c}")];
            if (r + c) % 3 == 0 {
                assert_eq!(value, &Value::Null);
            } else {
                assert_eq!(value, &Value::String(format!("r{r}c{c}")));
            }
        }
    }

    // keys appear in catalog order
    let text = document.as_str();
    let positions: Vec<usize> = (0..3)
        .map(|c| text.find(&format!("\"col{c}\"")).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_single_row_exact_text() {
    let mut result = ResultSet::new(
        vec![FieldDescriptor::new("id", "VARCHAR")],
        vec![vec![Some(b"abc".to_vec())]],
    );
    assert_eq!(encode(&mut result).unwrap().as_str(), r#"[{"id": "abc"}]"#);
}

#[test]
fn test_zero_rows() {
    let mut result = ResultSet::new(vec![FieldDescriptor::new("id", "INT")], Vec::new());
    let document = encode(&mut result).unwrap();
    assert_eq!(document.as_str(), "[]");
    assert_eq!(document.rows(), 0);
}

#[test]
fn test_rewound_result_encodes_identically() {
    let mut result = grid(3, 2);
    let first = encode(&mut result).unwrap();
    result.rewind();
    let second = encode(&mut result).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_special_characters_round_trip() {
    let raw = "quote \" backslash \\ newline \n tab \t bell \u{7} ünï";
    let mut result = ResultSet::new(
        vec![FieldDescriptor::new("body \"text\"", "TEXT")],
        vec![vec![Some(raw.as_bytes().to_vec())]],
    );
    let document = encode(&mut result).unwrap();

    let parsed: Value = serde_json::from_str(document.as_str()).unwrap();
    assert_eq!(parsed[0]["body \"text\""], Value::String(raw.to_string()));
}

#[test]
fn test_missing_metadata_leaves_buffer_unchanged() {
    let mut result = ResultSet::new(
        vec![FieldDescriptor::new("id", "INT"), FieldDescriptor::unnamed("TEXT")],
        vec![vec![Some(b"1".to_vec()), Some(b"x".to_vec())]],
    );
    let mut out = String::from("json = ");

    let err = encode_into(&mut result, &mut out).unwrap_err();
    assert!(matches!(err, EncodeError::MissingFieldMetadata { index: 1 }));
    assert_eq!(out, "json = ");
}

#[test]
fn test_ragged_row_is_rejected() {
    let mut result = ResultSet::new(
        vec![FieldDescriptor::new("a", "INT"), FieldDescriptor::new("b", "INT")],
        vec![
            vec![Some(b"1".to_vec()), Some(b"2".to_vec())],
            vec![Some(b"3".to_vec())],
        ],
    );
    let mut out = String::new();

    let err = encode_into(&mut result, &mut out).unwrap_err();
    assert!(matches!(
        err,
        EncodeError::RowShapeMismatch {
            row: 1,
            expected: 2,
            actual: 1
        }
    ));
    assert!(out.is_empty());
}
