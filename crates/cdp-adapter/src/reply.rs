//! Typed access to CDP reply envelopes.
//!
//! Field names and nesting follow the protocol: `id`, `result.*`, `error`,
//! `exceptionDetails`, `targetId`, `objectId`, `value`, `frameId`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AdapterError, AdapterErrorKind, AdapterResult};

/// Correlation id of a raw message, if it carries a positive one.
pub fn extract_id(json: &str) -> Option<u64> {
    #[derive(Deserialize)]
    struct IdOnly {
        id: Option<i64>,
    }
    let header: IdOnly = serde_json::from_str(json).ok()?;
    header.id.filter(|id| *id > 0).map(|id| id as u64)
}

/// An `error` object or `exceptionDetails` the browser returned instead of a result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DomainError {
    pub message: String,
    pub code: Option<i64>,
    pub details: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    raw: Value,
}

impl Reply {
    pub fn parse(text: &str) -> AdapterResult<Self> {
        let raw: Value = serde_json::from_str(text).map_err(|err| {
            AdapterError::new(AdapterErrorKind::ProtocolViolation)
                .with_hint(format!("reply is not valid json: {err}"))
        })?;
        Ok(Self { raw })
    }

    pub fn from_value(raw: Value) -> Self {
        Self { raw }
    }

    pub fn id(&self) -> Option<u64> {
        self.raw
            .get("id")
            .and_then(Value::as_i64)
            .filter(|id| *id > 0)
            .map(|id| id as u64)
    }

    /// Event messages carry a `method` and no `id`.
    pub fn method(&self) -> Option<&str> {
        self.raw.get("method").and_then(Value::as_str)
    }

    pub fn result(&self) -> Option<&Value> {
        self.raw.get("result")
    }

    pub fn error(&self) -> Option<&Value> {
        self.raw.get("error")
    }

    /// `exceptionDetails` is reported inside `result` by `Runtime.evaluate`
    /// and friends; some builds put it at the top level.
    pub fn exception_details(&self) -> Option<&Value> {
        self.get_path("result.exceptionDetails")
            .or_else(|| self.raw.get("exceptionDetails"))
    }

    /// Dotted lookup such as `result.result.value`; numeric segments index arrays.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        lookup(&self.raw, path)
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get_path(path).and_then(Value::as_str)
    }

    pub fn get_i64(&self, path: &str) -> Option<i64> {
        self.get_path(path).and_then(Value::as_i64)
    }

    pub fn target_id(&self) -> Option<&str> {
        self.get_str("result.targetId")
    }

    pub fn object_id(&self) -> Option<&str> {
        self.get_str("result.result.objectId")
            .or_else(|| self.get_str("result.object.objectId"))
    }

    /// `result.result.value` as returned by `Runtime.evaluate`.
    pub fn value(&self) -> Option<&Value> {
        self.get_path("result.result.value")
    }

    pub fn frame_id(&self) -> Option<&str> {
        self.get_str("result.frameId")
            .or_else(|| self.get_str("result.frameTree.frame.id"))
    }

    pub fn domain_error(&self) -> Option<DomainError> {
        if let Some(error) = self.error() {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Command failed")
                .to_string();
            return Some(DomainError {
                message,
                code: error.get("code").and_then(Value::as_i64),
                details: error.clone(),
            });
        }

        let details = self.exception_details()?;
        let message = lookup(details, "exception.description")
            .and_then(Value::as_str)
            .or_else(|| details.get("text").and_then(Value::as_str))
            .unwrap_or("Uncaught exception")
            .to_string();
        Some(DomainError {
            message,
            code: None,
            details: details.clone(),
        })
    }

    pub fn is_domain_error(&self) -> bool {
        self.domain_error().is_some()
    }

    pub fn as_value(&self) -> &Value {
        &self.raw
    }

    pub fn into_value(self) -> Value {
        self.raw
    }

    /// The `result` object, or a `DomainError` carrying the whole reply.
    pub fn into_result(self) -> AdapterResult<Value> {
        if let Some(domain) = self.domain_error() {
            return Err(AdapterError::new(AdapterErrorKind::DomainError)
                .with_hint(domain.message)
                .with_data(self.raw));
        }
        Ok(self.raw.get("result").cloned().unwrap_or(Value::Null))
    }
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(root, |node, segment| match node {
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|idx| items.get(idx)),
            _ => node.get(segment),
        })
}
