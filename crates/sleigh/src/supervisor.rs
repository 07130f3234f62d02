//! Process-level task orchestration: spawns each long-running task with a
//! bounded restart budget distinct from that task's own internal
//! reconnect-with-backoff, and drives the shutdown cascade on SIGINT or
//! SIGTERM (spec §7, `SPEC_FULL.md` §4 supplement).

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Runs `make_task()` to completion, restarting it up to `max_restarts`
/// times if it returns `Err` before `cancel` fires. A task that returns
/// `Ok(())` is treated as a clean, intentional exit (normally because
/// `cancel` was observed) and is not restarted.
///
/// Once the restart budget is exhausted, the error is returned so the
/// caller can bring the whole process down (spec §7: unrecoverable
/// subsystem failures are fatal, not silently swallowed).
pub async fn run_with_restarts<F, Fut, E>(
    name: &str,
    max_restarts: u32,
    cancel: &CancellationToken,
    mut make_task: F,
) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0_u32;
    loop {
        match make_task().await {
            Ok(()) => {
                tracing::info!(task = name, "supervisor.task.exited_cleanly");
                return Ok(());
            }
            Err(err) if cancel.is_cancelled() => {
                tracing::info!(task = name, %err, "supervisor.task.error_during_shutdown");
                return Ok(());
            }
            Err(err) => {
                attempt += 1;
                tracing::error!(task = name, attempt, max_restarts, %err, "supervisor.task.failed");
                if attempt > max_restarts {
                    cancel.cancel();
                    return Err(format!("{name} exhausted {max_restarts} restarts: {err}"));
                }
            }
        }
    }
}

/// Owns the shared cancellation token and the deadline given to in-flight
/// tasks to wind down once shutdown begins.
pub struct Supervisor {
    cancel: CancellationToken,
    shutdown_deadline: Duration,
}

impl Supervisor {
    #[must_use]
    pub fn new(shutdown_deadline: Duration) -> Self {
        Self { cancel: CancellationToken::new(), shutdown_deadline }
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for SIGINT, SIGTERM, or any spawned task to exit fatally,
    /// whichever comes first; then cancels every task and waits up to
    /// `shutdown_deadline` for them to wind down.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first fatal task failure, if any.
    pub async fn run_until_shutdown(self, mut tasks: JoinSet<Result<(), String>>) -> anyhow::Result<()> {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        let shutdown_reason = tokio::select! {
            _ = tokio::signal::ctrl_c() => "sigint",
            _ = sigterm.recv() => "sigterm",
            Some(result) = tasks.join_next() => {
                if let Ok(Err(err)) = &result {
                    tracing::error!("supervisor.task.fatal: {err}");
                }
                "task_exit"
            }
        };

        tracing::info!(reason = shutdown_reason, "supervisor.shutdown.begin");
        self.cancel.cancel();

        let mut first_error = None;
        let drain = async {
            while let Some(result) = tasks.join_next().await {
                match result {
                    Ok(Err(err)) if first_error.is_none() => first_error = Some(err),
                    Err(join_err) if first_error.is_none() => first_error = Some(join_err.to_string()),
                    _ => {}
                }
            }
        };

        if tokio::time::timeout(self.shutdown_deadline, drain).await.is_err() {
            tracing::warn!("supervisor.shutdown.deadline_exceeded: aborting remaining tasks");
            tasks.abort_all();
        }

        if let Some(err) = first_error {
            anyhow::bail!(err);
        }
        Ok(())
    }
}
