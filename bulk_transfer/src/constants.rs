utils::configurable_constants! {
    /// Number of files handed to the worker pool per batch. Also the capacity of the task queue.
    ref DEFAULT_BATCH_SIZE: usize = 50;

    /// Buffer size used when streaming an object to or from disk.
    ref TRANSFER_CHUNK_SIZE: usize = 5 * 1024 * 1024;

    /// Most parts a multipart session may hold.
    ref MAX_PARTS_PER_SESSION: u64 = 9_999;

    /// Floor for the computed part size.
    ref MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

    /// Uploads at least this large go through a multipart session.
    ref MULTIPART_UPLOAD_THRESHOLD: u64 = 64 * 1024 * 1024;

    /// Remote copies at least this large are copied part by part; smaller ones use a single
    /// server-side copy.
    ref MULTIPART_COPY_THRESHOLD: u64 = 5 * 1024 * 1024 * 1024;

    /// Most file ids sent in one credential request.
    ref CREDENTIAL_BATCH_LIMIT: usize = 50_000;

    /// A progress report is emitted every this many completed files.
    ref PROGRESS_REPORT_INTERVAL: u64 = 50;

    /// Upper bound for the default worker count.
    ref MAX_DEFAULT_WORKERS: usize = 20;

    /// Times a transfer is retried with refreshed credentials after they expire.
    ref CREDENTIAL_REFRESH_RETRIES: u32 = 1;
}

/// File name of the job table inside the ledger directory.
pub const JOBS_FILE_NAME: &str = "jobs.csv";

/// Suffix appended to a file while it is being downloaded.
pub const PARTIAL_SUFFIX: &str = ".partial";
