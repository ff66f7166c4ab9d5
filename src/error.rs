/// How an error at a transport boundary should be treated downstream.
/// Classification happens exactly once, where the error is produced; the
/// coordinator never re-inspects causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeout, connection loss, 5xx. Safe to retry via backoff.
    Retriable,
    /// 4xx auth/validation. Surfaced to the caller immediately, never retried.
    Terminal,
    /// The caller went away. Not an error: discarded silently, no retry.
    Cancelled,
}
