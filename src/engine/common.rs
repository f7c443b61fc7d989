// src/engine/common.rs
//
// Common utilities shared across engine modules.
// Provides the panic policy used at codec and worker boundaries.

use crate::error::MonotoneError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

/// Unified Result type for engine internals.
pub type EngineResult<T> = std::result::Result<T, MonotoneError>;

/// Run `f`, converting a panic into `InternalPanic` tagged with `stage`.
///
/// Codec bindings (mozjpeg in particular) report some failures by unwinding;
/// callers of the engine must only ever see a `Result`.
pub fn run_with_panic_policy<T, F>(stage: &'static str, f: F) -> EngineResult<T>
where
    F: FnOnce() -> EngineResult<T>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(target: "monotone::panic", %stage, %message, "panic caught at engine boundary");
            Err(MonotoneError::internal_panic(format!("{stage}: {message}")))
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_through_ok_and_err() {
        assert_eq!(run_with_panic_policy("t", || Ok(3)).unwrap(), 3);
        let err = run_with_panic_policy::<(), _>("t", || Err(MonotoneError::corrupted_image()))
            .unwrap_err();
        assert!(matches!(err, MonotoneError::CorruptedImage));
    }

    #[test]
    fn converts_panic_to_internal_error() {
        let err = run_with_panic_policy::<(), _>("encode:test", || panic!("boom")).unwrap_err();
        match err {
            MonotoneError::InternalPanic { message } => {
                assert!(message.contains("encode:test"));
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
