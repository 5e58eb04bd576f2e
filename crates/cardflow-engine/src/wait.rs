//! Cancellable waiting, sliced so a stop request is noticed quickly.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Default slice length for [`sleep_cancellable`].
pub const DEFAULT_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Sleep for `total`, in slices of at most `slice`, checking `cancel`
/// between slices.
///
/// Returns `true` if the full duration elapsed, `false` if the wait was cut
/// short by cancellation.
pub async fn sleep_cancellable(total: Duration, slice: Duration, cancel: &CancellationToken) -> bool {
    let slice = if slice.is_zero() { DEFAULT_WAIT_SLICE } else { slice };
    let mut remaining = total;
    while !remaining.is_zero() {
        if cancel.is_cancelled() {
            return false;
        }
        let step = remaining.min(slice);
        tokio::time::sleep(step).await;
        remaining = remaining.saturating_sub(step);
    }
    !cancel.is_cancelled()
}
