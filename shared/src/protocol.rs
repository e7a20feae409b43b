/// Legacy action endpoint kept for existing callers
pub const ACTION_PATH: &str = "/gcp-action/";

/// Operations accepted by the action endpoint
pub const OPERATIONS: [&str; 5] = ["status", "start", "stop", "suspend", "resume"];

/// SSE event names emitted while an operation runs
pub const EVENT_INFO: &str = "info";
pub const EVENT_STATUS: &str = "status";
pub const EVENT_PROGRESS: &str = "progress";
pub const EVENT_SUCCESS: &str = "success";
pub const EVENT_ERROR: &str = "error";

/// Reconnect hint sent with every SSE frame, in milliseconds
pub const SSE_RETRY_MS: u64 = 1000;

/// Server version reported by /health and /api-docs
pub const SERVER_VERSION: &str = "2.0.0";
