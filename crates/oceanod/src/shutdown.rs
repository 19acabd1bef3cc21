//! Signal handling and the bounded drain after shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::state::AppState;

/// How the server stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Every in-flight request finished.
    Completed,
    /// The grace period ran out first.
    Deadline,
}

/// Resolves once Ctrl-C or SIGTERM arrives. Readiness flips immediately so
/// load balancers stop routing new traffic here, and `signalled` is set so
/// the drain deadline starts counting.
pub async fn shutdown_signal(state: Arc<AppState>, signalled: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    state.begin_shutdown();
    let _ = signalled.send(true);
}

/// Run `server` to completion, but give up `grace` after `signalled` turns
/// true. In-flight requests still running at that point are abandoned.
pub async fn drain_with_deadline<F>(
    server: F,
    mut signalled: watch::Receiver<bool>,
    grace: Duration,
) -> std::io::Result<Drain>
where
    F: Future<Output = std::io::Result<()>>,
{
    let deadline = async move {
        if signalled.wait_for(|s| *s).await.is_err() {
            std::future::pending::<()>().await;
        }
        tracing::info!(grace_s = grace.as_secs(), "draining in-flight requests");
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server => result.map(|()| Drain::Completed),
        _ = deadline => {
            tracing::warn!(grace_s = grace.as_secs(), "grace period elapsed, abandoning in-flight requests");
            Ok(Drain::Deadline)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_stuck_server_is_cut_off_after_grace() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let start = Instant::now();
        let stuck = std::future::pending::<std::io::Result<()>>();

        let drain = drain_with_deadline(stuck, rx, Duration::from_millis(100)).await.unwrap();
        assert_eq!(drain, Drain::Deadline);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_no_deadline_before_signal() {
        let (_tx, rx) = watch::channel(false);
        let server = async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(())
        };
        let drain = drain_with_deadline(server, rx, Duration::from_millis(10)).await.unwrap();
        assert_eq!(drain, Drain::Completed);
    }

    #[tokio::test]
    async fn test_server_finishing_within_grace_completes() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let server = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        };
        let drain = drain_with_deadline(server, rx, Duration::from_secs(5)).await.unwrap();
        assert_eq!(drain, Drain::Completed);
    }
}
