//! Panic recovery for plugin code running inside the kernel.
//!
//! Plugin setup/tick/teardown and event handlers are foreign code. A panic in
//! any of them is captured here, logged, and turned into an `Error` so the
//! scheduler loop or bus dispatch that called it keeps going.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use crate::types::{Error, Result};

/// Await a future with panic recovery.
///
/// Panics raised while the future is being polled are caught, not just those
/// raised while constructing it.
pub async fn with_recovery_async<Fut, T>(future: Fut, operation_name: &str) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(recovered(&payload, operation_name)),
    }
}

fn recovered(payload: &Box<dyn Any + Send>, operation_name: &str) -> Error {
    let panic_msg = extract_panic_message(payload);
    tracing::error!(
        "panic_recovered: operation={}, panic={}",
        operation_name,
        panic_msg
    );
    Error::internal(format!("panic in {}: {}", operation_name, panic_msg))
}

/// Extract panic message from panic payload.
fn extract_panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic (no message)".to_string()
    }
}
