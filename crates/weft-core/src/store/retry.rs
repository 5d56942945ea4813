//! Retry policy: decides between another attempt and the dead-letter list.

/// What happens to a task after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to pending, at the tail of its priority tier.
    Requeue,
    /// Terminal `failed`, appended to the dead-letter list.
    DeadLetter,
}

/// Decide after the failure has been counted.
///
/// Retries are immediate: a requeued task goes to the tail of its tier and
/// waits for the next assignment pass. `retry_count` never exceeds
/// `max_retries`, so the task dead-letters exactly when the two are equal.
pub fn decide(retry_count: u32, max_retries: u32) -> RetryDecision {
    if retry_count >= max_retries {
        RetryDecision::DeadLetter
    } else {
        RetryDecision::Requeue
    }
}
