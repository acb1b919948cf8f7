pub mod config;
pub mod logging;
pub mod router;

pub use router::{McpRouter, RouterError};

/// Default location for the router's log file when only a bare name is given.
///
/// - macOS: `~/Library/Logs/mcp-router/`
/// - elsewhere: the platform data directory, then `~/.mcp-router/`
pub fn log_dir() -> std::path::PathBuf {
    #[cfg(target_os = "macos")]
    if let Some(home) = dirs::home_dir() {
        return home.join("Library").join("Logs").join("mcp-router");
    }
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-router");
    }
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".mcp-router")
}
