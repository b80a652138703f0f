//! Application configuration loading and validation.
//!
//! Reads `mcpilot.yaml` and resolves environment variables. Every section is
//! optional; a missing file means all defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::agent_core::{OrchestratorConfig, DEFAULT_MAX_ROUNDS};
use crate::mcp_client::{ServerConfig, SessionTimeouts};

/// File name searched for on disk.
pub const CONFIG_FILE_NAME: &str = "mcpilot.yaml";

/// Environment variable that points at a config file.
pub const CONFIG_ENV_VAR: &str = "MCPILOT_CONFIG";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("failed to read {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        let hint = match self {
            ConfigError::NotFound { .. } => "check the --config path or MCPILOT_CONFIG",
            ConfigError::Read { .. } => "check the file permissions",
            ConfigError::Parse { .. } => "fix the YAML syntax in the config file",
            ConfigError::Invalid { .. } => "correct the value named below",
        };
        format!("configuration problem; {hint} ({self})")
    }
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// The conversation model and how to reach it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub request_timeout_secs: u64,
    pub system_prompt: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 1000,
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            request_timeout_secs: 120,
            system_prompt: None,
        }
    }
}

/// Loop and session limits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_rounds: u32,
    pub init_timeout_secs: u64,
    pub list_timeout_secs: u64,
    pub call_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            init_timeout_secs: 30,
            list_timeout_secs: 30,
            call_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    pub fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            init: Duration::from_secs(self.init_timeout_secs),
            list: Duration::from_secs(self.list_timeout_secs),
            call: Duration::from_secs(self.call_timeout_secs),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
    /// Tool server to spawn; may instead come from the command line.
    pub server: Option<ServerConfig>,
    pub engine: EngineConfig,
}

impl AppConfig {
    /// Parse YAML text after env-var interpolation. Does not validate.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let interpolated = interpolate_env_vars(raw);
        if interpolated.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    /// Load and validate one file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut config = Self::from_yaml_str(&raw)?;
        if let Some(server) = config.server.as_mut() {
            expand_server_paths(server);
        }
        config.validate()?;
        Ok(config)
    }

    /// Locate and load the config, or fall back to defaults when none exists.
    ///
    /// Returns the path that was loaded, if any.
    pub fn resolve(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let start = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        match find_config_path(explicit, &start)? {
            Some(path) => Ok((Self::load(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    /// Check values the rest of the program relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_rounds == 0 {
            return Err(ConfigError::Invalid {
                reason: "engine.max_rounds must be at least 1".into(),
            });
        }
        if self.model.max_tokens == 0 {
            return Err(ConfigError::Invalid {
                reason: "model.max_tokens must be at least 1".into(),
            });
        }
        if self.model.model.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "model.model must not be empty".into(),
            });
        }
        if let Some(server) = &self.server {
            if server.command.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    reason: "server.command must not be empty".into(),
                });
            }
        }
        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            model: self.model.model.clone(),
            max_tokens: self.model.max_tokens,
            max_rounds: self.engine.max_rounds,
            system_prompt: self.model.system_prompt.clone(),
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Find the config file.
///
/// Order: the explicit path (which must exist), `MCPILOT_CONFIG`, a
/// `mcpilot.yaml` in `start` or any ancestor, then the user config dir.
pub fn find_config_path(explicit: Option<&Path>, start: &Path) -> Result<Option<PathBuf>, ConfigError> {
    // 1. Explicit flag
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(Some(path.to_path_buf()));
        }
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }

    // 2. Env var
    if let Ok(raw) = std::env::var(CONFIG_ENV_VAR) {
        if !raw.trim().is_empty() {
            let path = PathBuf::from(expand_tilde(&raw));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(ConfigError::NotFound { path });
        }
    }

    // 3. Walk upward from `start`
    if let Some(found) = find_upward(start) {
        return Ok(Some(found));
    }

    // 4. User config dir
    if let Some(dir) = dirs::config_dir() {
        let candidate = dir.join("mcpilot").join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(Some(candidate));
        }
    }

    Ok(None)
}

fn find_upward(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{}", home.display(), &path[1..]);
        }
    }
    path.to_string()
}

/// The server is spawned without a shell, so `~` in its command line has to
/// be expanded here.
fn expand_server_paths(server: &mut ServerConfig) {
    server.command = expand_tilde(&server.command);
    for arg in server.args.iter_mut() {
        *arg = expand_tilde(arg);
    }
    if let Some(cwd) = server.cwd.as_mut() {
        *cwd = expand_tilde(cwd);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = AppConfig::from_yaml_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.engine.max_rounds, 10);
        assert_eq!(config.engine.session_timeouts(), SessionTimeouts::default());
        assert!(config.server.is_none());
    }

    #[test]
    fn test_full_config_parses() {
        let yaml = r#"
model:
  model: claude-test
  max_tokens: 2048
  system_prompt: "Answer briefly."
server:
  name: weather
  command: python3
  args: ["weather.py"]
  env:
    NWS_USER_AGENT: mcpilot-test
engine:
  max_rounds: 4
  call_timeout_secs: 5
"#;
        let config = AppConfig::from_yaml_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.model.model, "claude-test");
        assert_eq!(config.model.api_key_env, "ANTHROPIC_API_KEY");
        let server = config.server.as_ref().unwrap();
        assert_eq!(server.args, vec!["weather.py"]);
        assert_eq!(server.env["NWS_USER_AGENT"], "mcpilot-test");
        assert_eq!(config.engine.init_timeout_secs, 30);

        let orch = config.orchestrator_config();
        assert_eq!(orch.max_rounds, 4);
        assert_eq!(orch.system_prompt.as_deref(), Some("Answer briefly."));
    }

    #[test]
    fn test_validation_rejects_zero_rounds() {
        let config = AppConfig::from_yaml_str("engine:\n  max_rounds: 0\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_validation_rejects_empty_command() {
        let config = AppConfig::from_yaml_str("server:\n  command: \"\"\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("server.command"));
    }

    #[test]
    fn test_parse_error_reported() {
        let err = AppConfig::from_yaml_str("engine: [unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_interpolation_in_config() {
        std::env::set_var("__MCPILOT_TEST_MODEL__", "from-env");
        let config = AppConfig::from_yaml_str(
            "model:\n  model: ${__MCPILOT_TEST_MODEL__}\n  base_url: ${__MCPILOT_UNSET_URL__:-http://localhost:9}\n",
        )
        .unwrap();
        assert_eq!(config.model.model, "from-env");
        assert_eq!(config.model.base_url, "http://localhost:9");
        std::env::remove_var("__MCPILOT_TEST_MODEL__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with no variables";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/servers");
        assert!(!result.starts_with('~'), "tilde should be expanded");
        assert!(result.ends_with("/servers"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "engine:\n  max_rounds: 3\n").unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.engine.max_rounds, 3);
    }

    #[test]
    fn test_expand_tilde_leaves_other_paths() {
        assert_eq!(expand_tilde("/opt/server.py"), "/opt/server.py");
        assert_eq!(expand_tilde("~alice/server.py"), "~alice/server.py");
        assert_eq!(expand_tilde("--flag=~/x"), "--flag=~/x");
    }

    #[test]
    fn test_load_expands_tilde_in_server_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            "server:\n  command: ~/bin/python3\n  args: [\"~/mcp-servers/weather/weather.py\", \"--verbose\"]\n  cwd: ~/mcp-servers\n",
        )
        .unwrap();

        let server = AppConfig::load(&path).unwrap().server.unwrap();
        let home = dirs::home_dir().unwrap().display().to_string();
        assert_eq!(server.command, format!("{home}/bin/python3"));
        assert_eq!(
            server.args,
            vec![format!("{home}/mcp-servers/weather/weather.py"), "--verbose".to_string()]
        );
        assert_eq!(server.cwd, Some(format!("{home}/mcp-servers")));
    }

    #[test]
    fn test_explicit_missing_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        let err = find_config_path(Some(&missing), dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn test_finds_config_in_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{}\n").unwrap();
        let found = find_upward(&nested).unwrap();
        assert_eq!(found, dir.path().join(CONFIG_FILE_NAME));
    }
}
