//! Conversion of SQLite values to JSON

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteValueRef;
use sqlx::{TypeInfo, Value, ValueRef};

use crate::Error;

/// Convert one SQLite value to JSON.
///
/// INTEGER keeps full i64 precision, REAL becomes a JSON number, TEXT a string
/// and BLOB a base64 string.
pub(crate) fn to_json(v: SqliteValueRef) -> Result<JsonValue, Error> {
   if v.is_null() {
      return Ok(JsonValue::Null);
   }

   let value = ValueRef::to_owned(&v);
   let res = match v.type_info().name() {
      "TEXT" | "DATE" | "TIME" | "DATETIME" => match value.try_decode::<String>() {
         Ok(s) => JsonValue::String(s),
         Err(_) => JsonValue::Null,
      },
      "REAL" => match value.try_decode::<f64>() {
         Ok(f) => JsonValue::from(f),
         Err(_) => JsonValue::Null,
      },
      "INTEGER" | "NUMERIC" | "BOOLEAN" => match value.try_decode::<i64>() {
         Ok(i) => JsonValue::Number(i.into()),
         Err(_) => JsonValue::Null,
      },
      "BLOB" => match value.try_decode::<Vec<u8>>() {
         Ok(bytes) => JsonValue::String(BASE64.encode(bytes)),
         Err(_) => JsonValue::Null,
      },
      "NULL" => JsonValue::Null,
      other => return Err(Error::UnsupportedDatatype(other.to_string())),
   };

   Ok(res)
}
