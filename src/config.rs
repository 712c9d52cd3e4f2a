//! Process configuration loaded from environment variables.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// Workspace opened on start-up, before the first `workspace.select`.
    pub workspace: Option<PathBuf>,
    /// `tracing_subscriber::EnvFilter` directive for stderr logging.
    pub log_filter: String,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            workspace: env_var("TUITIOND_WORKSPACE").map(PathBuf::from),
            log_filter: env_var("TUITIOND_LOG")
                .or_else(|| env_var("RUST_LOG"))
                .unwrap_or_else(|| "info".to_string()),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
