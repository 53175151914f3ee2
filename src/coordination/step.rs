//! Guarded execution of periodic loop steps

use crate::error::Result;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{error, warn};

/// Run one loop step, logging errors and panics instead of propagating them.
///
/// Returns true when the step completed successfully.
pub async fn run_step<F>(component: &str, step: &str, fut: F) -> bool
where
    F: Future<Output = Result<()>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(component, step, error_class = %e.class(), "Step failed: {}", e);
            false
        }
        Err(panic) => {
            error!(component, step, "Step panicked: {}", panic_message(panic.as_ref()));
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HiveError;

    #[tokio::test]
    async fn test_step_outcomes() {
        assert!(run_step("test", "ok", async { Ok(()) }).await);
        assert!(
            !run_step("test", "err", async { Err(HiveError::Transient("boom".into())) }).await
        );
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let ran = run_step("test", "panics", async {
            if true {
                panic!("step bug");
            }
            Ok(())
        })
        .await;
        assert!(!ran);
    }
}
