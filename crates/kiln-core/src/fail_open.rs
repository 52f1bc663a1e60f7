//! Fail-open helper for side channels
//!
//! Writing a log event must never decide the outcome of a run. Stage results,
//! patch application and status transitions are not routed through here.

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Run `f`, returning `None` and logging a warning if it fails.
///
/// ```no_run
/// use kiln_core::fail_open::fail_open;
/// use kiln_core::Result;
///
/// async fn append_event() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let written = fail_open("run_log", || append_event()).await;
///     assert!(written.is_some());
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KilnError;

    #[tokio::test]
    async fn test_fail_open_success() {
        let result = fail_open("test_op", || async { Ok::<_, KilnError>(7) }).await;
        assert_eq!(result, Some(7));
    }

    #[tokio::test]
    async fn test_fail_open_swallows_error() {
        let result = fail_open("test_op", || async {
            Err::<u32, _>(KilnError::Store("disk full".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }
}
