// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Knapsack

// Artifact Store
pub const KNAPSACK_ARTIFACT_BACKEND: &str = "KNAPSACK_ARTIFACT_BACKEND";
pub const KNAPSACK_SCRATCHPAD_DIR: &str = "KNAPSACK_SCRATCHPAD_DIR";
pub const KNAPSACK_DATABASE_URL: &str = "KNAPSACK_DATABASE_URL";

// Isolation Backend
pub const KNAPSACK_ISOLATION_BACKEND: &str = "KNAPSACK_ISOLATION_BACKEND";
pub const KNAPSACK_SANDBOX_IMAGE: &str = "KNAPSACK_SANDBOX_IMAGE";
pub const KNAPSACK_INTERPRETER: &str = "KNAPSACK_INTERPRETER";
pub const KNAPSACK_SANDBOX_WORKDIR: &str = "KNAPSACK_SANDBOX_WORKDIR";
pub const KNAPSACK_IMAGE_PULL_TIMEOUT_SECS: &str = "KNAPSACK_IMAGE_PULL_TIMEOUT_SECS";

// Resource Limits (no defaults for memory and timeout)
pub const KNAPSACK_MEMORY_LIMIT_BYTES: &str = "KNAPSACK_MEMORY_LIMIT_BYTES";
pub const KNAPSACK_DEFAULT_TIMEOUT_MS: &str = "KNAPSACK_DEFAULT_TIMEOUT_MS";
pub const KNAPSACK_CPU_CORES: &str = "KNAPSACK_CPU_CORES";
pub const KNAPSACK_PIDS_LIMIT: &str = "KNAPSACK_PIDS_LIMIT";
pub const KNAPSACK_MAX_CONCURRENT_SANDBOXES: &str = "KNAPSACK_MAX_CONCURRENT_SANDBOXES";

// Output Capture
pub const KNAPSACK_OUTPUT_LIMIT_BYTES: &str = "KNAPSACK_OUTPUT_LIMIT_BYTES";
pub const KNAPSACK_CAPTURE_LIMIT_BYTES: &str = "KNAPSACK_CAPTURE_LIMIT_BYTES";

// Research Tool
pub const KNAPSACK_RESEARCH_URL: &str = "KNAPSACK_RESEARCH_URL";
pub const KNAPSACK_RESEARCH_NAMESPACE: &str = "KNAPSACK_RESEARCH_NAMESPACE";
pub const KNAPSACK_RESEARCH_TOP_K: &str = "KNAPSACK_RESEARCH_TOP_K";
pub const KNAPSACK_RESEARCH_TIMEOUT_SECS: &str = "KNAPSACK_RESEARCH_TIMEOUT_SECS";

// Logging
pub const RUST_LOG: &str = "RUST_LOG";
