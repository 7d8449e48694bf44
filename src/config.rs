pub struct Config;

impl Config {
    /// Hard deadline for a single proxy acquisition.
    pub const PROXY_ACQUIRE_TIMEOUT_SECS: u64 = 3;
    /// How often the thaw task scans the freeze list.
    pub const THAW_SCAN_INTERVAL_SECS: u64 = 1;
    /// Timed-out queue rows are deleted in pages of this size.
    pub const COLLECT_PAGE_SIZE: usize = 512;
    /// Delay between worker spawns so the pool ramps up smoothly.
    pub const WORKER_STAGGER_SECS: u64 = 1;

    /// Displacement attempts before the cuckoo filter reports Full.
    pub const FILTER_MAX_KICKS: usize = 500;
    /// Fingerprint slots per cuckoo bucket.
    pub const FILTER_BUCKET_SLOTS: usize = 4;

    /// Upper bound on bucket keys and values, and on queue URLs.
    pub const MAX_RECORD_BYTES: usize = 500;
}
