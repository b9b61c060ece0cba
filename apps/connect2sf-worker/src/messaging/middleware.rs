//! Cross-cutting wrappers applied to handlers at registration time.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{Instrument, debug, error, warn};

use super::handler::{EventHandler, HandlerContext, HandlerError};
use crate::contracts::ValidationError;

const REMOVED_FIELDS: &[&str] = &["jwtToken", "accessToken", "access_token"];
const MAX_LOGGED_ARRAY: usize = 30;

/// Logs entry, exit and failures of the wrapped handler under `signature`.
pub struct Logged<H> {
    signature: &'static str,
    inner: H,
}

pub fn logged<H: EventHandler>(signature: &'static str, inner: H) -> Logged<H> {
    Logged { signature, inner }
}

#[async_trait]
impl<H: EventHandler> EventHandler for Logged<H> {
    fn validate(&self, payload: &Value) -> Result<(), ValidationError> {
        self.inner.validate(payload).inspect_err(|e| {
            warn!(signature = self.signature, error = %e, "Payload failed validation");
        })
    }

    async fn handle(&self, ctx: &HandlerContext, payload: Value) -> Result<(), HandlerError> {
        let signature = self.signature;
        debug!(signature, input = %sanitize(&payload), "ENTER");

        let result = self
            .inner
            .handle(ctx, payload)
            .instrument(ctx.span.clone())
            .await;

        match &result {
            Ok(()) => debug!(signature, "EXIT"),
            Err(e) if e.should_acknowledge() => {
                warn!(signature, trace_id = %ctx.trace_id, error = %e, "Handler rejected event")
            }
            Err(e) => {
                error!(signature, trace_id = %ctx.trace_id, error = %e, "Handler failed")
            }
        }
        result
    }
}

/// Copy of `value` that is safe to log: credentials are masked and long
/// arrays are summarized.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, v)| {
                    let v = if REMOVED_FIELDS.contains(&key.as_str()) {
                        Value::String("<removed>".to_string())
                    } else {
                        sanitize(v)
                    };
                    (key.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) if items.len() > MAX_LOGGED_ARRAY => {
            Value::String(format!("Array({})", items.len()))
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}
