//! Backoff for backend resubmission.
//!
//! Uses `backon` for exponential backoff with jitter. The orchestrators never
//! retry; only the DynamoDB backend resubmits throttled batch items.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for resubmitting `UnprocessedItems` of a batch write.
///
/// - Min delay: 50ms
/// - Max delay: 2s
/// - Max attempts: 8
/// - Jitter enabled
pub fn unprocessed_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(8)
        .with_jitter()
}
