//! Configuration loading.
//!
//! Loads bridge configuration from `./zulipgram.toml` (or
//! `$ZULIPGRAM_CONFIG_PATH`, or an explicit `--config` path).
//! Environment variables override file values; file values override
//! defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

// ── Top-level config ────────────────────────────────────────────

/// Top-level bridge configuration loaded from TOML.
///
/// Path: `./zulipgram.toml` or `$ZULIPGRAM_CONFIG_PATH`.
/// Env vars override file values; file values override defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ZulipgramConfig {
    /// Zulip account settings (`[zulip]`).
    pub zulip: ZulipSection,
    /// Telegram delivery settings (`[telegram]`).
    pub telegram: TelegramSection,
    /// Webhook listener settings (`[webhooks]`).
    pub webhooks: WebhooksSection,
    /// Relay behaviour toggles (`[bridge]`).
    pub bridge: BridgeSection,
    /// Filesystem paths (`[paths]`).
    pub paths: PathsSection,
}

impl ZulipgramConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// `path` overrides the file lookup when given. If the file does
    /// not exist, defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::load_from_file(path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path_with(|key| std::env::var(key).ok()),
        };
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: ZulipgramConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(ZulipgramConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(p) = env("ZULIPGRAM_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("zulipgram.toml")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability (avoids unsafe
    /// `set_var` in tests). The bare `ZULIP_*` names match the
    /// variables zuliprc users already export.
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        // Zulip.
        if let Some(v) = env("ZULIPGRAM_ZULIP_SITE").or_else(|| env("ZULIP_SITE")) {
            self.zulip.site = v;
        }
        if let Some(v) = env("ZULIPGRAM_ZULIP_EMAIL").or_else(|| env("ZULIP_EMAIL")) {
            self.zulip.email = v;
        }
        if let Some(v) = env("ZULIPGRAM_ZULIP_KEY").or_else(|| env("ZULIP_KEY")) {
            self.zulip.api_key = v;
        }

        // Telegram.
        if let Some(v) = env("ZULIPGRAM_TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = v;
        }
        if let Some(v) = env("ZULIPGRAM_TELEGRAM_CHAT_ID") {
            match v.parse() {
                Ok(n) => self.telegram.chat_id = Some(n),
                Err(_) => tracing::warn!(
                    var = "ZULIPGRAM_TELEGRAM_CHAT_ID",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }

        // Webhooks.
        if let Some(v) = env("ZULIPGRAM_WEBHOOKS_PORT") {
            match v.parse() {
                Ok(n) => self.webhooks.port = n,
                Err(_) => tracing::warn!(
                    var = "ZULIPGRAM_WEBHOOKS_PORT",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }

        // Paths.
        if let Some(v) = env("ZULIPGRAM_LOGS_DIR") {
            self.paths.logs_dir = v;
        }
    }

    /// Reject configs that cannot run: every credential must be set
    /// and the Zulip site must be an absolute URL.
    pub fn validate(&self) -> Result<()> {
        if self.zulip.site.is_empty() {
            bail!("zulip.site is not set (ZULIP_SITE)");
        }
        if !self.zulip.site.starts_with("http://") && !self.zulip.site.starts_with("https://") {
            bail!("zulip.site must start with http:// or https://");
        }
        if self.zulip.email.is_empty() {
            bail!("zulip.email is not set (ZULIP_EMAIL)");
        }
        if self.zulip.api_key.is_empty() {
            bail!("zulip.api_key is not set (ZULIP_KEY)");
        }
        if self.telegram.bot_token.is_empty() {
            bail!("telegram.bot_token is not set (ZULIPGRAM_TELEGRAM_BOT_TOKEN)");
        }
        Ok(())
    }

    /// Parse a TOML string into config (for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: ZulipgramConfig =
            toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }
}

// ── Zulip section ───────────────────────────────────────────────

/// Zulip account settings (`[zulip]`).
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct ZulipSection {
    /// Realm URL, e.g. `https://your-org.zulipchat.com`.
    pub site: String,
    /// Bot or user email for basic auth.
    pub email: String,
    /// API key for basic auth.
    pub api_key: String,
}

impl std::fmt::Debug for ZulipSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZulipSection")
            .field("site", &self.site)
            .field("email", &self.email)
            .field("api_key", &"__REDACTED__")
            .finish()
    }
}

// ── Telegram section ────────────────────────────────────────────

/// Telegram delivery settings (`[telegram]`).
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelegramSection {
    /// Bot API token.
    pub bot_token: String,
    /// Operator's private chat id. Optional; without it the bridge
    /// runs but only logs what it would forward.
    pub chat_id: Option<i64>,
}

impl std::fmt::Debug for TelegramSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramSection")
            .field("bot_token", &"__REDACTED__")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

// ── Webhooks section ────────────────────────────────────────────

/// Webhook listener settings (`[webhooks]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhooksSection {
    /// Whether the listener starts at all.
    pub enabled: bool,
    /// Listen port.
    pub port: u16,
}

impl Default for WebhooksSection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 6464,
        }
    }
}

// ── Bridge section ──────────────────────────────────────────────

/// Relay behaviour toggles (`[bridge]`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BridgeSection {
    /// Suppress DMs whose sender email matches the configured
    /// account. Off by default so self-tests stay visible.
    pub ignore_self_messages: bool,
    /// Stop the event loop on the first handler failure instead of
    /// logging and continuing.
    pub halt_on_handler_error: bool,
}

// ── Paths section ───────────────────────────────────────────────

/// Filesystem paths (`[paths]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    /// Directory for rotated log files.
    pub logs_dir: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            logs_dir: "./logs".to_string(),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ZulipgramConfig::default();

        assert!(config.zulip.site.is_empty());
        assert!(config.telegram.chat_id.is_none());
        assert!(config.webhooks.enabled);
        assert_eq!(config.webhooks.port, 6464);
        assert!(!config.bridge.ignore_self_messages);
        assert!(!config.bridge.halt_on_handler_error);
        assert_eq!(config.paths.logs_dir, "./logs");
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[zulip]
site = "https://org.zulipchat.com"
email = "bot@org.com"
api_key = "zulip-key"

[telegram]
bot_token = "123:abc"
chat_id = 415494855

[webhooks]
enabled = false
port = 9000

[bridge]
ignore_self_messages = true
halt_on_handler_error = true

[paths]
logs_dir = "/var/log/zulipgram"
"#;

        let config = ZulipgramConfig::from_toml(toml_str).expect("should parse");

        assert_eq!(config.zulip.site, "https://org.zulipchat.com");
        assert_eq!(config.zulip.email, "bot@org.com");
        assert_eq!(config.zulip.api_key, "zulip-key");
        assert_eq!(config.telegram.bot_token, "123:abc");
        assert_eq!(config.telegram.chat_id, Some(415494855));
        assert!(!config.webhooks.enabled);
        assert_eq!(config.webhooks.port, 9000);
        assert!(config.bridge.ignore_self_messages);
        assert!(config.bridge.halt_on_handler_error);
        assert_eq!(config.paths.logs_dir, "/var/log/zulipgram");
    }

    #[test]
    fn test_parse_partial_toml_uses_defaults() {
        let toml_str = r#"
[zulip]
site = "https://org.zulipchat.com"
"#;

        let config = ZulipgramConfig::from_toml(toml_str).expect("should parse");

        assert_eq!(config.zulip.site, "https://org.zulipchat.com");
        assert!(config.zulip.email.is_empty());
        assert_eq!(config.webhooks.port, 6464);
    }

    #[test]
    fn test_parse_empty_toml_uses_defaults() {
        let config = ZulipgramConfig::from_toml("").expect("should parse empty");
        assert_eq!(config.webhooks.port, 6464);
        assert!(config.webhooks.enabled);
    }

    #[test]
    fn test_env_overrides_config_values() {
        let toml_str = r#"
[zulip]
site = "https://from-file.zulipchat.com"
email = "file@org.com"

[webhooks]
port = 7000
"#;

        let mut config = ZulipgramConfig::from_toml(toml_str).expect("should parse");

        let env = |key: &str| -> Option<String> {
            match key {
                "ZULIPGRAM_ZULIP_SITE" => Some("https://from-env.zulipchat.com".to_string()),
                "ZULIPGRAM_WEBHOOKS_PORT" => Some("8000".to_string()),
                _ => None,
            }
        };
        config.apply_overrides(env);

        // Env wins over file.
        assert_eq!(config.zulip.site, "https://from-env.zulipchat.com");
        assert_eq!(config.webhooks.port, 8000);

        // File value kept when no env override.
        assert_eq!(config.zulip.email, "file@org.com");
    }

    #[test]
    fn test_bare_zulip_env_names_are_aliases() {
        let mut config = ZulipgramConfig::default();

        let env = |key: &str| -> Option<String> {
            match key {
                "ZULIP_SITE" => Some("https://bare.zulipchat.com".to_string()),
                "ZULIP_EMAIL" => Some("bare@org.com".to_string()),
                "ZULIP_KEY" => Some("bare-key".to_string()),
                _ => None,
            }
        };
        config.apply_overrides(env);

        assert_eq!(config.zulip.site, "https://bare.zulipchat.com");
        assert_eq!(config.zulip.email, "bare@org.com");
        assert_eq!(config.zulip.api_key, "bare-key");
    }

    #[test]
    fn test_prefixed_env_wins_over_bare_alias() {
        let mut config = ZulipgramConfig::default();

        let env = |key: &str| -> Option<String> {
            match key {
                "ZULIPGRAM_ZULIP_SITE" => Some("https://prefixed.example".to_string()),
                "ZULIP_SITE" => Some("https://bare.example".to_string()),
                _ => None,
            }
        };
        config.apply_overrides(env);

        assert_eq!(config.zulip.site, "https://prefixed.example");
    }

    #[test]
    fn test_invalid_chat_id_env_is_ignored() {
        let mut config = ZulipgramConfig::default();

        let env = |key: &str| -> Option<String> {
            match key {
                "ZULIPGRAM_TELEGRAM_CHAT_ID" => Some("not-a-number".to_string()),
                _ => None,
            }
        };
        config.apply_overrides(env);

        assert!(config.telegram.chat_id.is_none());
    }

    #[test]
    fn test_config_path_uses_env_var() {
        let path = ZulipgramConfig::config_path_with(|key| match key {
            "ZULIPGRAM_CONFIG_PATH" => Some("/custom/zulipgram.toml".to_string()),
            _ => None,
        });
        assert_eq!(path, PathBuf::from("/custom/zulipgram.toml"));
    }

    #[test]
    fn test_config_path_defaults_to_cwd() {
        let path = ZulipgramConfig::config_path_with(|_| None);
        assert_eq!(path, PathBuf::from("zulipgram.toml"));
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let result = ZulipgramConfig::from_toml("this is {{ not valid toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_requires_credentials() {
        let config = ZulipgramConfig::default();
        assert!(config.validate().is_err());

        let full = ZulipgramConfig::from_toml(
            r#"
[zulip]
site = "https://org.zulipchat.com"
email = "bot@org.com"
api_key = "k"

[telegram]
bot_token = "123:abc"
"#,
        )
        .expect("should parse");
        assert!(full.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_relative_site() {
        let config = ZulipgramConfig::from_toml(
            r#"
[zulip]
site = "org.zulipchat.com"
email = "bot@org.com"
api_key = "k"

[telegram]
bot_token = "123:abc"
"#,
        )
        .expect("should parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = ZulipgramConfig::from_toml(
            r#"
[zulip]
api_key = "zulip-secret"

[telegram]
bot_token = "bot-secret"
"#,
        )
        .expect("should parse");

        let debug = format!("{config:?}");
        assert!(debug.contains("__REDACTED__"));
        assert!(!debug.contains("zulip-secret"));
        assert!(!debug.contains("bot-secret"));
    }
}
