use chrono::NaiveDate;
use serde_json::json;

use crate::calc::CalcError;
use crate::ipc::error::err;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Field-keyed validation error.
    pub fn field(field: &str, message: impl Into<String>) -> Self {
        Self {
            code: "bad_params",
            message: message.into(),
            details: Some(json!({ "field": field })),
        }
    }

    pub fn not_found(what: &str) -> Self {
        Self::new("not_found", format!("{} not found", what))
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<CalcError> for HandlerErr {
    fn from(e: CalcError) -> Self {
        let code = match e.code.as_str() {
            "not_found" => "not_found",
            _ => "db_query_failed",
        };
        Self {
            code,
            message: e.message,
            details: e.details,
        }
    }
}

pub fn db_query(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

pub fn db_insert(e: rusqlite::Error, table: &str) -> HandlerErr {
    HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": table })),
    }
}

pub fn db_update(e: rusqlite::Error, table: &str) -> HandlerErr {
    HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": table })),
    }
}

pub fn db_tx(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_tx_failed", e.to_string())
}

pub fn db_commit(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_commit_failed", e.to_string())
}

pub fn required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::field(key, format!("missing {}", key)))
}

pub fn optional_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let s = v
                .as_str()
                .ok_or_else(|| HandlerErr::field(key, format!("{} must be string or null", key)))?
                .trim()
                .to_string();
            if s.is_empty() {
                Ok(None)
            } else {
                Ok(Some(s))
            }
        }
    }
}

pub fn required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::field(key, format!("missing {}", key)))
}

pub fn optional_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::field(key, format!("{} must be an integer", key))),
    }
}

pub fn required_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::field(key, format!("missing {}", key)))
}

pub fn optional_f64(params: &serde_json::Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| HandlerErr::field(key, format!("{} must be a number", key))),
    }
}

pub fn optional_bool(
    params: &serde_json::Value,
    key: &str,
    default: bool,
) -> Result<bool, HandlerErr> {
    match params.get(key) {
        None => Ok(default),
        Some(v) if v.is_null() => Ok(default),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| HandlerErr::field(key, format!("{} must be boolean", key))),
    }
}

pub fn parse_date_str(key: &str, raw: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| HandlerErr::field(key, format!("{} must be YYYY-MM-DD", key)))
}

pub fn required_date(params: &serde_json::Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = required_str(params, key)?;
    parse_date_str(key, &raw)
}

pub fn optional_date(params: &serde_json::Value, key: &str) -> Result<Option<NaiveDate>, HandlerErr> {
    match optional_str(params, key)? {
        None => Ok(None),
        Some(raw) => parse_date_str(key, &raw).map(Some),
    }
}

/// Acting user id. Always an explicit parameter so tests can pin attribution.
pub fn actor(params: &serde_json::Value) -> Result<String, HandlerErr> {
    required_str(params, "actorId")
}

/// Mutation timestamp: explicit `at` param, or the wall clock.
pub fn timestamp(params: &serde_json::Value) -> Result<String, HandlerErr> {
    match optional_str(params, "at")? {
        Some(v) => Ok(v),
        None => Ok(chrono::Utc::now().to_rfc3339()),
    }
}

/// Reference date for date-window queries: explicit `today` param, or the
/// wall clock. Threaded so month-scoped checks are deterministic in tests.
pub fn today(params: &serde_json::Value) -> Result<NaiveDate, HandlerErr> {
    match optional_str(params, "today")? {
        Some(raw) => parse_date_str("today", &raw),
        None => Ok(chrono::Utc::now().date_naive()),
    }
}
