//! The task-race primitive shared by the per-device supervisors and the
//! fleet coordinator: run N tasks, return when the first finishes, cancel
//! the rest, and surface every non-cancellation error.

use std::future::Future;

use futures_util::future::select_all;
use log::warn;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};

/// Spawn a future raced against a cancellation token. When the token fires
/// the future is dropped and the task resolves with `Cancelled`.
pub fn spawn_cancellable<F>(cancel: CancellationToken, fut: F) -> JoinHandle<Result<()>>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => Err(BridgeError::Cancelled),
            res = fut => res,
        }
    })
}

/// Wait for the first of `handles` to finish, cancel the shared `children`
/// token, then await the remaining tasks. Errors from tasks that finished on
/// their own are all collected; the first is returned and the rest logged.
/// Cancellation outcomes (`Cancelled` results, aborted tasks) are swallowed.
///
/// The token is cancelled *before* the losers are awaited: a pending task can
/// still fail while the winner is being processed, and that error must be
/// surfaced rather than lost.
pub async fn race_and_cancel(
    children: CancellationToken,
    handles: Vec<JoinHandle<Result<()>>>,
) -> Result<()> {
    if handles.is_empty() {
        children.cancel();
        return Ok(());
    }

    let (first, _index, rest) = select_all(handles).await;
    let mut errors = Vec::new();
    collect_outcome(first, &mut errors);

    children.cancel();
    for handle in rest {
        collect_outcome(handle.await, &mut errors);
    }

    for extra in errors.iter().skip(1) {
        warn!("additional task error: {extra}");
    }
    match errors.into_iter().next() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn collect_outcome(
    outcome: std::result::Result<Result<()>, JoinError>,
    errors: &mut Vec<BridgeError>,
) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(BridgeError::Cancelled)) => {}
        Ok(Err(err)) => errors.push(err),
        Err(join_err) if join_err.is_cancelled() => {}
        Err(join_err) => errors.push(BridgeError::Internal(format!(
            "task panicked: {join_err}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn winner_error_is_surfaced_and_losers_cancelled() {
        let children = CancellationToken::new();
        let loser_finished = Arc::new(AtomicBool::new(false));
        let flag = loser_finished.clone();

        let handles = vec![
            spawn_cancellable(children.clone(), async {
                Err(BridgeError::Transport("boom".into()))
            }),
            spawn_cancellable(children.clone(), async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }),
        ];

        let err = race_and_cancel(children, handles).await.unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert!(!loser_finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn clean_winner_returns_ok() {
        let children = CancellationToken::new();
        let handles = vec![
            spawn_cancellable(children.clone(), async { Ok(()) }),
            spawn_cancellable(children.clone(), async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        ];
        assert!(race_and_cancel(children, handles).await.is_ok());
    }

    #[tokio::test]
    async fn cancellation_results_are_not_errors() {
        let children = CancellationToken::new();
        let handles = vec![
            spawn_cancellable(children.clone(), async { Ok(()) }),
            spawn_cancellable(children.clone(), async {
                std::future::pending::<()>().await;
                Ok(())
            }),
            spawn_cancellable(children.clone(), async {
                std::future::pending::<()>().await;
                Ok(())
            }),
        ];
        assert!(race_and_cancel(children, handles).await.is_ok());
    }

    #[tokio::test]
    async fn late_error_from_already_finished_loser_is_collected() {
        let children = CancellationToken::new();
        // Both tasks finish nearly together; whichever is processed second
        // must still have its error surfaced, not dropped.
        let handles = vec![
            spawn_cancellable(children.clone(), async { Ok(()) }),
            spawn_cancellable(children.clone(), async {
                Err(BridgeError::Protocol(
                    crate::error::ProtocolError::AuthRejected,
                ))
            }),
        ];
        let result = race_and_cancel(children, handles).await;
        assert!(matches!(result, Err(BridgeError::Protocol(_))));
    }

    #[tokio::test]
    async fn outer_cancellation_resolves_every_task() {
        let children = CancellationToken::new();
        let handles = vec![
            spawn_cancellable(children.clone(), async {
                std::future::pending::<()>().await;
                Ok(())
            }),
            spawn_cancellable(children.clone(), async {
                std::future::pending::<()>().await;
                Ok(())
            }),
        ];
        children.cancel();
        assert!(race_and_cancel(children, handles).await.is_ok());
    }

    #[tokio::test]
    async fn panic_surfaces_as_internal_error() {
        let children = CancellationToken::new();
        let handles = vec![
            tokio::spawn(async { panic!("deliberate") }),
            spawn_cancellable(children.clone(), async {
                std::future::pending::<()>().await;
                Ok(())
            }),
        ];
        let err = race_and_cancel(children, handles).await.unwrap_err();
        assert!(matches!(err, BridgeError::Internal(_)));
    }
}
