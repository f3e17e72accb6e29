//! Retrying remote calls with [`keen_retry`].
//!
//! Remote calls return a [`RetryResult`], which distinguishes transient errors
//! (worth another try after a backoff) from fatal ones. The macros below give
//! us `?`-like shorthand for building those results, and
//! [`retry_with_backoff`] runs the retry loop itself.

use async_openai::error::OpenAIError;
use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};
use reqwest::StatusCode;

use crate::prelude::*;

/// On error, return a [`RetryResult::Fatal`] value.
macro_rules! try_fatal {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

/// On error, return either a [`RetryResult::Transient`] or a
/// [`RetryResult::Fatal`] value, according to [`IsKnownTransient`].
macro_rules! try_potentially_transient {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) if $crate::retry::IsKnownTransient::is_known_transient(&error) => {
                ::tracing::debug!("Transient error: {:?}", error);
                return ::keen_retry::RetryResult::Transient {
                    input: (),
                    error: From::from(error),
                };
            }
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

// Export our macros to the rest of the crate like normal items.
pub(crate) use {try_fatal, try_potentially_transient};

/// Build a [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build a [`RetryResult::Fatal`] value.
pub(crate) fn retry_result_fatal<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Fatal { input: (), error }
}

/// Is this error a known transient error?
///
/// Errors are fatal until we've seen them in the wild and confirmed that
/// retrying helps. Otherwise we'd spend minutes backing off from errors which
/// will never go away.
pub trait IsKnownTransient {
    /// Is this error likely to go away if we try again?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        match self.status() {
            Some(status) => status.is_known_transient(),
            // Connection resets, DNS hiccups and the like. `reqwest` doesn't
            // give us enough detail to tell these apart.
            None => !self.is_builder() && !self.is_decode(),
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ]
        .contains(self)
    }
}

impl IsKnownTransient for OpenAIError {
    fn is_known_transient(&self) -> bool {
        match self {
            OpenAIError::Reqwest(err) => err.is_known_transient(),
            OpenAIError::ApiError(err) => {
                err.r#type.as_deref() == Some("server_error")
                    || err.code.as_deref() == Some("rate_limit_exceeded")
            }
            _ => false,
        }
    }
}

/// A value which we eventually got, and the errors we saw along the way.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub retry_errors: Vec<String>,
}

/// Format an error and its causes on one line.
pub fn error_to_string(err: &anyhow::Error) -> String {
    format!("{:#}", err)
}

/// Call `attempt` until it succeeds, fails fatally, or we run out of retries.
///
/// Transient failures back off exponentially with jitter, up to 5 retries.
pub async fn retry_with_backoff<T, Fut>(
    attempt: impl Fn() -> Fut,
) -> Result<Retried<T>>
where
    Fut: Future<Output = RetryResult<(), (), T, anyhow::Error>>,
{
    let jitter = ExponentialJitter::FromBackoffRange {
        backoff_range_millis: 1..=30_000,
        re_attempts: 5,
        jitter_ratio: 0.2,
    };

    let result = attempt()
        .await
        .retry_with_async(|_| attempt())
        .with_exponential_jitter(|| jitter)
        .await
        .inspect_recovered(|_, _, retry_errors_list| {
            warn!(
                "succeeded after retrying {} times (failed attempts: [{}])",
                retry_errors_list.len(),
                keen_retry::loggable_retry_errors(retry_errors_list)
            )
        })
        .inspect_given_up(|_, retry_errors_list, fatal_error| {
            error!(
                "gave up after {} retries with error {fatal_error:#}. Previous transient failures: [{}]",
                retry_errors_list.len(),
                keen_retry::loggable_retry_errors(retry_errors_list)
            )
        });

    match result {
        ResolvedResult::Ok { output, .. } => Ok(Retried {
            value: output,
            retry_errors: vec![],
        }),
        ResolvedResult::Recovered {
            output,
            retry_errors,
            ..
        } => Ok(Retried {
            value: output,
            retry_errors: retry_errors.iter().map(error_to_string).collect(),
        }),
        ResolvedResult::Fatal { error, .. } => Err(error),
        ResolvedResult::GivenUp {
            retry_errors,
            fatal_error,
            ..
        }
        | ResolvedResult::Unrecoverable {
            retry_errors,
            fatal_error,
            ..
        } => Err(fatal_error
            .context(format!("failed after {} attempts", retry_errors.len() + 1))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_status_codes() {
        assert!(StatusCode::TOO_MANY_REQUESTS.is_known_transient());
        assert!(StatusCode::SERVICE_UNAVAILABLE.is_known_transient());
        assert!(!StatusCode::NOT_FOUND.is_known_transient());
        assert!(!StatusCode::UNAUTHORIZED.is_known_transient());
    }

    #[test]
    fn test_openai_api_errors() {
        let api_error = |r#type: &str| {
            OpenAIError::ApiError(async_openai::error::ApiError {
                message: "oops".to_owned(),
                r#type: Some(r#type.to_owned()),
                param: None,
                code: None,
            })
        };
        assert!(api_error("server_error").is_known_transient());
        assert!(!api_error("invalid_request_error").is_known_transient());
        assert!(!OpenAIError::InvalidArgument("bad".to_owned()).is_known_transient());
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let calls = AtomicUsize::new(0);
        let retried = retry_with_backoff(|| async {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            if call < 2 {
                RetryResult::Transient {
                    input: (),
                    error: anyhow!("flaky {call}"),
                }
            } else {
                retry_result_ok(call)
            }
        })
        .await
        .unwrap();
        assert_eq!(retried.value, 2);
        assert_eq!(retried.retry_errors, vec!["flaky 0", "flaky 1"]);
    }

    #[tokio::test]
    async fn test_retry_stops_on_fatal_errors() {
        let calls = AtomicUsize::new(0);
        let err = retry_with_backoff(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            retry_result_fatal::<(), _>(anyhow!("broken"))
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.to_string().contains("broken"));
    }
}
