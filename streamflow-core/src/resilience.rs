//! Resilience helpers for calls that leave the process.
//!
//! Retry logic is provided by the `backon` crate at the call sites; this
//! module holds the shared timeout defaults and the error classification
//! used to decide whether a failed upstream call is worth retrying.

pub mod timeout {
    //! Timeout configuration for external calls

    use std::time::Duration;

    /// Default timeout for upstream HTTP requests
    pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Extra wall-clock allowance for media-inspector startup, on top of the
    /// analysis duration and the read timeout.
    pub const PROBE_STARTUP_BUFFER: Duration = Duration::from_secs(10);
}

pub mod retry {
    //! Retry policy for upstream HTTP calls

    use std::time::Duration;

    use backon::ExponentialBuilder;

    use crate::error::Error;

    /// Maximum retry attempts for transient upstream failures
    pub const MAX_UPSTREAM_RETRIES: usize = 3;

    /// Backoff policy shared by all upstream calls: exponential from 500ms,
    /// capped at 10s.
    #[must_use]
    pub fn upstream_backoff() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(10))
            .with_max_times(MAX_UPSTREAM_RETRIES)
    }

    /// Check if an error should be retried.
    ///
    /// Only transient upstream conditions qualify; auth failures, 4xx
    /// responses and local errors are returned to the caller immediately.
    #[must_use]
    pub fn should_retry(err: &Error) -> bool {
        err.is_transient()
    }
}
