//! Canonical default values shared across pipeline stages.

pub const DEFAULT_STORE_PATH: &str = "engagement.sqlite3";
pub const DEFAULT_HOME_DIR: &str = ".engagement_pipeline";
pub const HOME_ENV_VAR: &str = "ENGAGEMENT_HOME";

/// Default worker cap for per-dataset fan-out.
pub const DEFAULT_WORKERS: usize = 4;
/// Hard worker cap.
pub const HARD_MAX_WORKERS: usize = 16;

pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 4;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 250;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 8_000;
pub const DEFAULT_SOURCE_TIMEOUT_SECS: u64 = 30;

/// Upper bound on coding-tool slots bound to one code scheme.
pub const MAX_CODING_SLOTS: usize = 10;

/// Compare-and-swap attempts before a label write gives up.
pub const CAS_MAX_ATTEMPTS: u32 = 8;

/// Separator used when joining a participant's raw demographic responses.
pub const RAW_TEXT_JOINER: &str = ";";

pub const CANCELLED_BY_USER_MESSAGE: &str = "Cancelled by user";
