//! Unbounded retry around external work.
//!
//! External failures are treated as transient: a step is retried after a fixed backoff
//! until it succeeds. Each attempt is logged with its number and the captured stderr.

use crate::encode::{Invocation, ProcessRunner};
use crate::relocate::{move_into_place, remove_entry, RelocateError};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt<T> {
    Done(T),
    /// Transient failure, with a description for the log.
    Retry(String),
}

/// Fixed backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(backoff: Duration) -> Self {
        Self { backoff }
    }
}

/// Outcome of a retried step.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Run `op` until it returns [`Attempt::Done`], sleeping `policy.backoff` between attempts.
pub async fn retry_forever<T, F, Fut>(step: &str, policy: RetryPolicy, mut op: F) -> Retried<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let mut attempt: u32 = 1;
    loop {
        match op(attempt).await {
            Attempt::Done(value) => {
                return Retried {
                    value,
                    attempts: attempt,
                }
            }
            Attempt::Retry(detail) => {
                warn!(
                    step,
                    attempt,
                    backoff_secs = policy.backoff.as_secs(),
                    "{} failed, retrying: {}",
                    step,
                    detail
                );
                tokio::time::sleep(policy.backoff).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

/// Run `invocation` until it succeeds and leaves its output behind, then move the output
/// to `destination`. Returns the number of attempts.
///
/// Any stale output from an earlier crash is removed before each attempt, and a stale file
/// at `destination` is replaced.
pub async fn run_external(
    runner: Arc<dyn ProcessRunner>,
    invocation: Invocation,
    destination: &Path,
    policy: RetryPolicy,
) -> Result<u32, RelocateError> {
    let step = invocation.program.clone();
    let invocation = Arc::new(invocation);

    let retried = retry_forever(&step, policy, |attempt| {
        let runner = runner.clone();
        let invocation = invocation.clone();
        async move {
            debug!(attempt, command = %invocation.display(), "Running external command");
            let outcome = tokio::task::spawn_blocking(move || {
                if let Some(parent) = invocation.output.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                remove_entry(&invocation.output).map_err(std::io::Error::other)?;
                let output = runner.run(&invocation)?;
                Ok::<_, std::io::Error>((output, invocation.output.exists()))
            })
            .await;

            match outcome {
                Ok(Ok((output, true))) if output.success => Attempt::Done(()),
                Ok(Ok((output, false))) if output.success => {
                    Attempt::Retry("process succeeded but produced no output".to_string())
                }
                Ok(Ok((output, _))) => Attempt::Retry(format!(
                    "exit code {:?}\n{}",
                    output.code,
                    output.stderr_tail()
                )),
                Ok(Err(e)) => Attempt::Retry(format!("failed to run: {}", e)),
                Err(e) => Attempt::Retry(format!("worker task failed: {}", e)),
            }
        }
    })
    .await;

    let produced = invocation.output.clone();
    let target = destination.to_path_buf();
    tokio::task::spawn_blocking(move || move_into_place(&produced, &target))
        .await
        .map_err(|e| RelocateError::Move {
            from: invocation.output.clone(),
            to: destination.to_path_buf(),
            source: std::io::Error::other(e),
        })??;

    Ok(retried.attempts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRunner;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn touch_invocation(output: PathBuf) -> Invocation {
        Invocation {
            program: "fake-encoder".to_string(),
            args: vec![],
            output,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_forever_counts_attempts() {
        let retried = retry_forever("probe", RetryPolicy::new(Duration::from_secs(150)), |n| async move {
            if n < 4 {
                Attempt::Retry(format!("attempt {}", n))
            } else {
                Attempt::Done(n * 10)
            }
        })
        .await;

        assert_eq!(retried, Retried { value: 40, attempts: 4 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_external_retries_then_relocates() {
        let temp_dir = TempDir::new().unwrap();
        let scratch = temp_dir.path().join("scratch/movies/Film.mkv");
        let dest = temp_dir.path().join("converted/movies/Film.mkv");
        let runner = Arc::new(FakeRunner::failing_first(2));

        let attempts = run_external(
            runner.clone(),
            touch_invocation(scratch.clone()),
            &dest,
            RetryPolicy::new(Duration::from_secs(150)),
        )
        .await
        .unwrap();

        assert_eq!(attempts, 3);
        assert_eq!(runner.calls().len(), 3);
        assert!(dest.exists());
        assert!(!scratch.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_external_clears_stale_scratch_output() {
        let temp_dir = TempDir::new().unwrap();
        let scratch = temp_dir.path().join("scratch/Film.mkv");
        std::fs::create_dir_all(scratch.parent().unwrap()).unwrap();
        std::fs::write(&scratch, b"partial from a crash").unwrap();
        let dest = temp_dir.path().join("converted/Film.mkv");

        let runner = Arc::new(FakeRunner::new());
        run_external(
            runner,
            touch_invocation(scratch),
            &dest,
            RetryPolicy::new(Duration::from_secs(1)),
        )
        .await
        .unwrap();

        assert_ne!(std::fs::read(&dest).unwrap(), b"partial from a crash");
    }
}
