//! Conversions between engine record batches and JSON rows.

use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::datatypes::{FieldRef, SchemaRef};
use datafusion::arrow::json::ArrayWriter;
use serde_arrow::schema::{SchemaLike, TracingOptions};
use serde_json::{Map, Value};

use crate::errors::{FlapiError, Result};

/// Render record batches as a list of JSON objects, one per row, keeping
/// the column order of the schema.
pub fn batches_to_json_rows(batches: &[RecordBatch]) -> Result<Vec<Map<String, Value>>> {
    if batches.is_empty() {
        return Ok(Vec::new());
    }

    let mut writer = ArrayWriter::new(Vec::new());
    let refs: Vec<&RecordBatch> = batches.iter().collect();
    writer.write_batches(&refs)?;
    writer.finish()?;

    let bytes = writer.into_inner();
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<Map<String, Value>> = serde_json::from_slice(&bytes)?;
    Ok(rows)
}

/// Total row count across batches.
pub fn count_rows(batches: &[RecordBatch]) -> usize {
    batches.iter().map(RecordBatch::num_rows).sum()
}

/// Schema of a batch set, if any batch exists.
pub fn batches_schema(batches: &[RecordBatch]) -> Option<SchemaRef> {
    batches.first().map(RecordBatch::schema)
}

/// Build a record batch from a list of JSON objects, inferring the schema
/// from the samples. Used to materialize externally-fetched documents
/// (e.g. secret payloads) as engine tables.
pub fn record_batch_from_json(values: &[Value]) -> Result<RecordBatch> {
    if values.is_empty() {
        return Err(FlapiError::Engine(
            "cannot build a table from an empty document list".to_string(),
        ));
    }

    let fields: Vec<FieldRef> = Vec::<FieldRef>::from_samples(
        values,
        TracingOptions::default()
            .allow_null_fields(true)
            .coerce_numbers(true)
            .map_as_struct(true),
    )?;

    let batch = serde_arrow::to_record_batch(&fields, &values)?;
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::{Int64Array, StringArray};
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn sample_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec![Some("a"), None])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_batches_to_json_rows() {
        let rows = batches_to_json_rows(&[sample_batch()]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("id"), Some(&Value::from(1)));
        assert_eq!(rows[0].get("name"), Some(&Value::from("a")));
    }

    #[test]
    fn test_empty_batches() {
        assert!(batches_to_json_rows(&[]).unwrap().is_empty());
        assert_eq!(count_rows(&[]), 0);
    }

    #[test]
    fn test_record_batch_from_json() {
        let values = vec![
            serde_json::json!({"username": "admin", "password": "secret"}),
            serde_json::json!({"username": "reader", "password": "plain"}),
        ];
        let batch = record_batch_from_json(&values).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 2);
    }
}
