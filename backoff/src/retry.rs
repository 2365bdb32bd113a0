use std::time::Duration;

use tokio::time::sleep;

use crate::{Condition, Operation};

/// Runs `operation`, retrying retryable errors with the cool-off periods
/// yielded by `backoff`.
///
/// The first run is not a retry: a strategy that yields `n` periods allows
/// `n + 1` attempts in total. The last error is returned unchanged when the
/// strategy is exhausted or when `condition` rejects it.
pub async fn retry<I, O, C>(backoff: I, mut operation: O, mut condition: C) -> Result<O::Item, O::Error>
where
    I: IntoIterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    let mut backoff = backoff.into_iter();
    loop {
        match operation.run().await {
            Ok(item) => return Ok(item),
            Err(err) => {
                if !condition.can_retry(&err) {
                    return Err(err);
                }
                match backoff.next() {
                    Some(cool_off) => sleep(cool_off).await,
                    None => return Err(err),
                }
            }
        }
    }
}
