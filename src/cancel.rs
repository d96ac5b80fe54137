//! Cancellation at process and network boundaries.

use crate::error::{AppError, Result};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Run `fut` until it completes or `cancel` fires.
///
/// The future is dropped on cancellation, so child processes spawned with
/// `kill_on_drop` and in-flight HTTP requests are torn down with it.
pub async fn until_cancelled<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AppError::Cancelled),
        res = fut => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_completes_when_not_cancelled() {
        let cancel = CancellationToken::new();
        let value = until_cancelled(&cancel, async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cancelled_before_completion() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let res: Result<()> = until_cancelled(&cancel, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await;

        assert!(matches!(res, Err(AppError::Cancelled)));
    }
}
