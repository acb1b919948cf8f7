//! Configuration loading.
//!
//! Reads the router's YAML file, resolving `${VAR}` and `${VAR:-default}`
//! references against the environment before parsing.

use std::path::{Path, PathBuf};

use crate::router::errors::RouterError;

use super::types::RouterConfig;

/// Environment variable that points at the config file.
pub const CONFIG_ENV_VAR: &str = "MCP_ROUTER_CONFIG";

/// Resolve which config file to load.
///
/// Resolution order:
/// 1. An explicit path (from the command line).
/// 2. `MCP_ROUTER_CONFIG`.
/// 3. `<platform config dir>/mcp-router/config.yaml`.
pub fn find_config_path(explicit: Option<&Path>) -> Result<PathBuf, RouterError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Ok(PathBuf::from(expand_tilde(&path)));
        }
    }

    dirs::config_dir()
        .map(|dir| dir.join("mcp-router").join("config.yaml"))
        .ok_or_else(|| RouterError::ConfigInvalid {
            reason: format!("no config path given and {CONFIG_ENV_VAR} is not set"),
        })
}

/// Load and parse the router configuration file.
pub fn load_config(path: &Path) -> Result<RouterConfig, RouterError> {
    let raw = std::fs::read_to_string(path).map_err(|e| RouterError::ConfigInvalid {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    parse_config(&raw)
}

/// Parse configuration text (after env-var interpolation).
pub fn parse_config(raw: &str) -> Result<RouterConfig, RouterError> {
    let interpolated = interpolate_env_vars(raw);

    let config: RouterConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| RouterError::ConfigInvalid {
            reason: format!("failed to parse config: {e}"),
        })?;
    config.router.validate()?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
///
/// An unterminated `${` is copied through literally.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                result.push_str(&resolve_var_expr(&after[..end]));
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    result.push_str(rest);
    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__MCP_ROUTER_MISSING_VAR__");
        let result = interpolate_env_vars("url: ${__MCP_ROUTER_MISSING_VAR__:-http://127.0.0.1:9000}");
        assert_eq!(result, "url: http://127.0.0.1:9000");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__MCP_ROUTER_TEST_VAR__", "/opt/tools");
        let result = interpolate_env_vars("cwd: ${__MCP_ROUTER_TEST_VAR__:-/fallback}");
        assert_eq!(result, "cwd: /opt/tools");
        std::env::remove_var("__MCP_ROUTER_TEST_VAR__");
    }

    #[test]
    fn test_interpolate_unterminated_is_literal() {
        assert_eq!(interpolate_env_vars("a ${B"), "a ${B");
        assert_eq!(interpolate_env_vars("plain"), "plain");
    }

    #[test]
    fn test_parse_config_defaults() {
        let config = parse_config(
            r#"
servers:
  - name: echo
    command: cat
    args: []
"#,
        )
        .unwrap();
        assert_eq!(config.router.failure_threshold, 5);
        assert_eq!(config.router.call_timeout_ms, 30_000);
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].name.as_deref(), Some("echo"));
        assert!(config.servers[0].auto_start.is_none());
    }

    #[test]
    fn test_parse_config_rejects_garbage() {
        let err = parse_config("servers: [: nope").unwrap_err();
        assert!(matches!(err, RouterError::ConfigInvalid { .. }));
    }

    #[test]
    fn test_parse_config_rejects_zero_timeouts() {
        for field in ["call_timeout_ms", "http_timeout_ms", "recovery_timeout_ms"] {
            let err = parse_config(&format!("router:\n  {field}: 0\nservers: []")).unwrap_err();
            match err {
                RouterError::ConfigInvalid { reason } => assert!(reason.contains(field)),
                other => panic!("expected ConfigInvalid, got {other:?}"),
            }
        }

        let config = parse_config("router:\n  shutdown_grace_ms: 0\nservers: []").unwrap();
        assert_eq!(config.router.shutdown_grace_ms, 0);
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "router:\n  failure_threshold: 3\n  recovery_timeout_ms: 1000\nservers:\n  - name: web\n    url: http://127.0.0.1:8931/mcp"
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.router.breaker().failure_threshold, 3);
        assert_eq!(config.servers[0].url.as_deref(), Some("http://127.0.0.1:8931/mcp"));
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn test_explicit_path_wins() {
        let path = find_config_path(Some(Path::new("/tmp/router.yaml"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/router.yaml"));
    }
}
