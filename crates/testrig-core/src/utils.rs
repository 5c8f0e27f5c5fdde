/*!
 * Utility functions and helpers for testrig.
 *
 * Retries are a caller-level policy: nothing below the caller retries on its own.
 */
use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::Error;

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `future` - The future to run
///
/// # Returns
///
/// The result of the future, or a timeout error converted into the caller's error type
pub async fn with_timeout<F, T, E>(duration: Duration, future: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<Error>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!("Operation timed out after {:?}", duration)).into()),
    }
}

/// Run an operation, retrying a bounded number of times with a fixed delay
///
/// # Arguments
///
/// * `retries` - The number of retries after the first attempt
/// * `delay` - The fixed delay between attempts
/// * `future_factory` - A function that creates a new future for each attempt
///
/// # Returns
///
/// The first successful result, or the last error if every attempt fails
pub async fn with_retry<F, Fut, T, E>(retries: usize, delay: Duration, mut future_factory: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let start = Instant::now();
    let mut attempt = 0;

    loop {
        match future_factory().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("Succeeded after {} retries", attempt);
                }
                return Ok(result);
            }
            Err(e) if attempt < retries => {
                warn!("Attempt {} failed: {}", attempt + 1, e);
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!("All {} retries failed after {:?}", retries, start.elapsed());
                return Err(e);
            }
        }
    }
}
