//! Change records and the envelopes they travel in.
//!
//! Records are decoded one by one from loose JSON so that a single malformed
//! record never poisons the rest of its batch.

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cdcrelay::types::{TableName, UserId};
use crate::error::{ErrorCode, RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Insert,
    Update,
    Delete,
}

/// Emitter metadata; older emitters only put the table name here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub table_schema: String,
    #[serde(default)]
    pub table_name: String,
}

/// One row-level change produced by the change emitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub action: Action,
    #[serde(default)]
    pub table_name: TableName,
    #[serde(default)]
    pub changes: Option<Map<String, Value>>,
    #[serde(default)]
    pub record: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RecordMetadata>,
}

impl ChangeRecord {
    pub fn new(action: Action, table_name: impl Into<TableName>, record: Map<String, Value>) -> Self {
        Self {
            action,
            table_name: table_name.into(),
            changes: None,
            record,
            metadata: None,
        }
    }

    /// Decode one record, lifting `metadata.table_name` to the top level
    pub fn from_value(value: Value) -> Result<Self> {
        let mut record: ChangeRecord = serde_json::from_value(value)?;
        if record.table_name.is_empty() {
            if let Some(meta) = &record.metadata {
                record.table_name = meta.table_name.clone();
            }
        }
        if record.table_name.is_empty() {
            return Err(RelayError::new(ErrorCode::MalformedEnvelope, "Record without table name"));
        }
        Ok(record)
    }

    pub fn table(&self) -> &str {
        &self.table_name
    }

    /// Non-empty string value of a record field
    pub fn field_str(&self, field: &str) -> Option<&str> {
        match self.record.get(field) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    /// Natural key of the record: a non-empty string or a number, as text
    pub fn natural_key(&self, field: &str) -> Option<String> {
        match self.record.get(field) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Decode records individually, dropping the ones that fail.
///
/// Returns the decoded records and the number that were dropped.
pub fn decode_records(values: Vec<Value>) -> (Vec<ChangeRecord>, usize) {
    let mut records = Vec::with_capacity(values.len());
    let mut dropped = 0;
    for (index, value) in values.into_iter().enumerate() {
        match ChangeRecord::from_value(value) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!("Dropping malformed record #{}: {}", index, e);
                dropped += 1;
            }
        }
    }
    (records, dropped)
}

/// Inbound body of the router endpoint
#[derive(Debug, Deserialize)]
pub struct RouteRequest {
    pub records: Vec<Value>,
}

/// Response of the router endpoint
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteResponse {
    pub users: Vec<UserId>,
}

/// Payload of one stream frame, also the batched webhook envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamPayload<T = ChangeRecord> {
    pub data: Vec<T>,
}

/// Parse a webhook body: either `{"data": [...]}` or one bare record.
///
/// Only a body that is neither shape is an error.
pub fn parse_webhook_body(body: &[u8]) -> Result<(Vec<ChangeRecord>, usize)> {
    let value: Value = serde_json::from_slice(body).map_err(|e| {
        RelayError::new(ErrorCode::MalformedEnvelope, format!("Body is not JSON: {}", e))
    })?;

    match value {
        Value::Object(mut obj) if obj.contains_key("data") => match obj.remove("data") {
            Some(Value::Array(items)) if !items.is_empty() => Ok(decode_records(items)),
            _ => Err(RelayError::new(ErrorCode::MalformedEnvelope, "`data` must be a non-empty array")),
        },
        single @ Value::Object(_) => {
            let record = ChangeRecord::from_value(single).map_err(|e| {
                RelayError::new(ErrorCode::MalformedEnvelope, format!("Unrecognized CDC payload: {}", e))
            })?;
            Ok((vec![record], 0))
        }
        _ => Err(RelayError::new(ErrorCode::MalformedEnvelope, "Unrecognized CDC payload format")),
    }
}

/// Table-scoped slice of a batch, forwarded as one unit
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryBatch {
    pub table_name: TableName,
    pub records: Vec<ChangeRecord>,
}

/// Split records into per-table batches, keeping first-seen table order and
/// the relative order of records within a table.
pub fn group_by_table(records: Vec<ChangeRecord>) -> Vec<DeliveryBatch> {
    let mut batches: Vec<DeliveryBatch> = Vec::new();
    for record in records {
        match batches.iter_mut().find(|b| b.table_name == record.table_name) {
            Some(batch) => batch.records.push(record),
            None => batches.push(DeliveryBatch {
                table_name: record.table_name.clone(),
                records: vec![record],
            }),
        }
    }
    batches
}
