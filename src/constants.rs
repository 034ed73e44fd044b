/// Project descriptor served by the capability probe. There is a single
/// logical project; clients only need a stable id.
pub const PROJECT_ID: &str = "parley";
pub const PROJECT_NAME: &str = "Parley";

/// Upstream streaming endpoint suffix for a turn.
pub const ADVANCE_STREAM_PATH: &str = "/threads/advancestream";

/// Header carrying the server-side credential to the upstream service.
pub const UPSTREAM_KEY_HEADER: &str = "x-api-key";

/// Runaway-upstream guards for one relayed stream.
pub const MAX_STREAM_LINES: usize = 100_000;
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

pub const DB_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
    "PRAGMA foreign_keys = ON",
];

/// Generated thread names are cut to this many characters.
pub const THREAD_NAME_MAX_CHARS: usize = 48;
