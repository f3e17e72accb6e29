//! Asynchronous utilities for use with Tokio.
//!
//! This is the plumbing underneath our queue-based architecture. Most of the
//! rest of the code should be able to treat it as a black box.

use std::pin::Pin;

use futures::Stream;
use tokio::task::JoinHandle;

use crate::prelude::*;

pub mod io;
pub mod size_hint;

/// A boxed future, to keep complex future types out of signatures.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// A boxed stream, to keep complex stream types out of signatures.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// A handle for a background worker. Await [`JoinWorker::join`] to wait for
/// it to finish.
pub struct JoinWorker {
    future: BoxedFuture<Result<()>>,
}

impl JoinWorker {
    /// Wrap a Tokio [`JoinHandle`].
    pub fn from_handle(handle: JoinHandle<Result<()>>) -> Self {
        Self {
            future: Box::pin(async move { handle.await.context("could not join task")? }),
        }
    }

    /// Wait for the worker to complete.
    pub async fn join(self) -> Result<()> {
        self.future.await
    }
}

/// Report an external command's failure, including anything it printed to
/// standard error.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(command_name, output = %stdout, "Standard output from command");
    if !stderr.trim().is_empty() {
        // Tesseract prints progress chatter here even when it succeeds.
        debug!(command_name, output = %stderr, "Standard error from command");
    }

    if output.status.success() {
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!("{} failed with error output:\n{}", command_name, stderr))
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    #[test]
    #[cfg(unix)]
    fn test_check_for_command_failure() {
        let output = Command::new("sh").args(["-c", "exit 0"]).output().unwrap();
        assert!(check_for_command_failure("sh", &output).is_ok());

        let output = Command::new("sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .output()
            .unwrap();
        let err = check_for_command_failure("sh", &output).unwrap_err();
        assert!(err.to_string().contains("exit code 3"));
        assert!(err.to_string().contains("oops"));
    }
}
