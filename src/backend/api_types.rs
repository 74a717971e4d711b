use color_eyre::{eyre::eyre, Result};
use serde_json::Value;

use super::types::Record;

/// Column every table exposes as its primary key.
pub const ID_COLUMN: &str = "id";

/// Convert one row object into a Record.
///
/// Numeric and UUID/text ids are both accepted; the payload is the row as-is.
pub fn row_to_record(row: Value) -> Result<Record> {
  let id = match row.get(ID_COLUMN) {
    Some(Value::String(s)) if !s.is_empty() => s.clone(),
    Some(Value::Number(n)) => n.to_string(),
    Some(other) => return Err(eyre!("Row has unusable id: {}", other)),
    None => return Err(eyre!("Row is missing the '{}' column", ID_COLUMN)),
  };

  Ok(Record::new(id, row))
}

/// Decode a response body (a JSON array of row objects).
pub fn decode_rows(body: &[u8]) -> Result<Vec<Record>> {
  let rows: Vec<Value> =
    serde_json::from_slice(body).map_err(|e| eyre!("Failed to parse rows: {}", e))?;
  rows.into_iter().map(row_to_record).collect()
}
