use std::time::Duration;

utils::configurable_constants! {
    /// Number of retries for transient errors (502/503/504 and connection failures).
    ref CLIENT_RETRY_MAX_ATTEMPTS: u32 = 5;

    /// Base delay before the first retry; doubles on each attempt.
    ref CLIENT_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

    /// Upper bound on the delay between retries.
    ref CLIENT_RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

    /// Timeout for requests that don't stream a body back.
    ref CLIENT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

    /// Timeout for establishing a connection.
    ref CLIENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Read timeout on streaming bodies. Resets whenever data arrives.
    ref CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(120);

    /// Page size requested from the metadata service.
    ref METADATA_PAGE_SIZE: usize = 1000;
}
