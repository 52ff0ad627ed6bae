//! TOML configuration for Conduit.
//!
//! Reads configuration from multiple sources with precedence:
//! CLI flags > env vars > config file > defaults

use conduit_mcp::{McpConfig, ServerDescriptor};
use conduit_types::{ConfigError, Credential, StaticCredential};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The default chat API base URL.
pub const DEFAULT_API_BASE_URL: &str = "https://api.anthropic.com";

/// The default model to use.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";

/// The default max tokens for a response.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct ConduitConfig {
    /// Chat credential; `None` when nothing is configured (MCP-only use).
    pub credential: Option<Credential>,
    pub model: String,
    pub max_tokens: u32,
    pub api_base_url: String,
    pub config_dir: PathBuf,
    pub mcp: McpConfig,
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub servers: HashMap<String, ServerDescriptor>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiSettings {
    pub api_key: Option<String>,
    /// OAuth-style token sent as `Authorization: Bearer`.
    pub auth_token: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub base_url: Option<String>,
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
}

impl ConduitConfig {
    /// Load configuration from `~/.conduit/config.toml` and the process
    /// environment.
    pub fn load(overrides: CliOverrides) -> Result<Self, ConfigError> {
        Self::load_from(&config_dir(), |key| std::env::var(key).ok(), overrides)
    }

    /// Load from an explicit config directory and environment lookup.
    ///
    /// Precedence (highest to lowest):
    /// 1. CLI flags
    /// 2. Environment variables
    /// 3. `<config_dir>/config.toml`
    /// 4. Defaults
    pub fn load_from(
        config_dir: &Path,
        env: impl Fn(&str) -> Option<String>,
        overrides: CliOverrides,
    ) -> Result<Self, ConfigError> {
        let settings = load_settings_file(&config_dir.join("config.toml"))?;

        // An API key wins over a bearer token at the same tier.
        let credential = overrides
            .api_key
            .map(Credential::ApiKey)
            .or_else(|| env("ANTHROPIC_API_KEY").map(Credential::ApiKey))
            .or_else(|| env("ANTHROPIC_AUTH_TOKEN").map(Credential::Bearer))
            .or_else(|| settings.api.api_key.clone().map(Credential::ApiKey))
            .or_else(|| settings.api.auth_token.clone().map(Credential::Bearer));

        let model = overrides
            .model
            .or_else(|| env("CONDUIT_MODEL"))
            .or(settings.api.model)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let max_tokens = overrides
            .max_tokens
            .or(settings.api.max_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS);

        let api_base_url = env("ANTHROPIC_BASE_URL")
            .or(settings.api.base_url)
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());

        Ok(ConduitConfig {
            credential,
            model,
            max_tokens,
            api_base_url,
            config_dir: config_dir.to_path_buf(),
            mcp: McpConfig {
                servers: settings.servers,
            },
        })
    }

    /// The chat credential, or an error explaining how to provide one.
    pub fn credential_provider(&self) -> Result<StaticCredential, ConfigError> {
        self.credential
            .clone()
            .map(StaticCredential::new)
            .ok_or_else(|| ConfigError::MissingKey {
                key: "api_key (set ANTHROPIC_API_KEY or add to ~/.conduit/config.toml)".into(),
            })
    }

    /// Descriptor of a configured MCP server.
    pub fn server(&self, name: &str) -> Result<&ServerDescriptor, ConfigError> {
        self.mcp
            .descriptor(name)
            .ok_or_else(|| ConfigError::UnknownServer {
                name: name.to_string(),
            })
    }
}

/// Get the Conduit config directory path (~/.conduit/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CONDUIT_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".conduit")
}

/// Load and parse a TOML settings file. A missing file means defaults; a
/// malformed one is an error.
fn load_settings_file(path: &Path) -> Result<SettingsFile, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::debug!("No config at {}: {e}", path.display());
            return Ok(SettingsFile::default());
        }
    };
    toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_config(dir: &Path, content: &str) {
        std::fs::write(dir.join("config.toml"), content).unwrap();
    }

    #[test]
    fn defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConduitConfig::load_from(dir.path(), no_env, CliOverrides::default()).unwrap();
        assert!(config.credential.is_none());
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
        assert!(config.mcp.servers.is_empty());
        assert!(matches!(
            config.credential_provider(),
            Err(ConfigError::MissingKey { .. })
        ));
    }

    #[test]
    fn file_settings_and_servers() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
[api]
api_key = "sk-file"
model = "claude-opus-4-6"
max_tokens = 8192
base_url = "http://localhost:9999"

[servers.echo]
command = "python3"
args = ["echo_server.py"]
timeout_ms = 5000
"#,
        );
        let config = ConduitConfig::load_from(dir.path(), no_env, CliOverrides::default()).unwrap();
        assert_eq!(config.credential, Some(Credential::ApiKey("sk-file".into())));
        assert_eq!(config.model, "claude-opus-4-6");
        assert_eq!(config.max_tokens, 8192);
        assert_eq!(config.api_base_url, "http://localhost:9999");

        let echo = config.server("echo").unwrap();
        assert_eq!(echo.command, "python3");
        assert_eq!(echo.timeout(), Duration::from_secs(5));
        assert!(matches!(
            config.server("nope"),
            Err(ConfigError::UnknownServer { .. })
        ));
    }

    #[test]
    fn env_beats_file_and_cli_beats_env() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "[api]\napi_key = \"sk-file\"\nmodel = \"file-model\"\nbase_url = \"http://file\"\n",
        );
        let env = |key: &str| match key {
            "ANTHROPIC_API_KEY" => Some("sk-env".to_string()),
            "CONDUIT_MODEL" => Some("env-model".to_string()),
            "ANTHROPIC_BASE_URL" => Some("http://env".to_string()),
            _ => None,
        };

        let config = ConduitConfig::load_from(dir.path(), env, CliOverrides::default()).unwrap();
        assert_eq!(config.credential, Some(Credential::ApiKey("sk-env".into())));
        assert_eq!(config.model, "env-model");
        assert_eq!(config.api_base_url, "http://env");

        let overrides = CliOverrides {
            api_key: Some("sk-cli".into()),
            model: Some("cli-model".into()),
            max_tokens: Some(100),
        };
        let config = ConduitConfig::load_from(dir.path(), env, overrides).unwrap();
        assert_eq!(config.credential, Some(Credential::ApiKey("sk-cli".into())));
        assert_eq!(config.model, "cli-model");
        assert_eq!(config.max_tokens, 100);
    }

    #[test]
    fn auth_token_becomes_bearer() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "[api]\nauth_token = \"oauth-file\"\n");
        let config = ConduitConfig::load_from(dir.path(), no_env, CliOverrides::default()).unwrap();
        assert_eq!(config.credential, Some(Credential::Bearer("oauth-file".into())));

        let env = |key: &str| (key == "ANTHROPIC_AUTH_TOKEN").then(|| "oauth-env".to_string());
        let config = ConduitConfig::load_from(dir.path(), env, CliOverrides::default()).unwrap();
        assert_eq!(config.credential, Some(Credential::Bearer("oauth-env".into())));
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "[api\nmodel = ");
        let err = ConduitConfig::load_from(dir.path(), no_env, CliOverrides::default()).unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => assert!(path.ends_with("config.toml")),
            other => panic!("Expected Parse error, got {other:?}"),
        }
    }

    #[test]
    fn server_without_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "[servers.broken]\nargs = [\"x\"]\n");
        assert!(matches!(
            ConduitConfig::load_from(dir.path(), no_env, CliOverrides::default()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
