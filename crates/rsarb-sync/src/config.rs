use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rsarb_adapters::{HttpClientConfig, RedditCredentials};
use serde::Deserialize;
use tokio::fs;

pub const CLIENT_SECRET_ENV: &str = "RSARB_CLIENT_SECRET";
pub const PASSWORD_ENV: &str = "RSARB_PASSWORD";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BotConfig {
    pub platform: PlatformConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformConfig {
    pub client_id: String,
    pub client_secret: String,
    pub password: String,
    pub username: String,
    pub user_agent: String,
    /// `+`-joined subreddit names.
    pub subreddits: String,
    pub feedback_subreddit: String,
    /// URI of the thread whose commenters form the opt-in roster.
    pub opt_in_thread: String,
}

impl std::fmt::Debug for PlatformConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformConfig")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("user_agent", &self.user_agent)
            .field("subreddits", &self.subreddits)
            .field("feedback_subreddit", &self.feedback_subreddit)
            .field("opt_in_thread", &self.opt_in_thread)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleConfig {
    pub scan_cron: String,
    pub roster_cron: String,
    pub ledger_cron: String,
    pub post_limit: usize,
    /// How many of the bot's newest replies are checked after a silent drop.
    pub silent_drop_window: usize,
    pub http_timeout_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            scan_cron: "0 * * * * *".to_string(),
            roster_cron: "0 0 * * * *".to_string(),
            ledger_cron: "0 30 3 * * *".to_string(),
            post_limit: 100,
            silent_drop_window: 5,
            http_timeout_secs: 20,
        }
    }
}

impl BotConfig {
    /// Read, apply secret overrides from the environment, and validate.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config =
            Self::from_yaml_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
            .validate()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = lookup(CLIENT_SECRET_ENV) {
            self.platform.client_secret = secret;
        }
        if let Some(password) = lookup(PASSWORD_ENV) {
            self.platform.password = password;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let platform = &self.platform;
        for (key, value) in [
            ("platform.client_id", &platform.client_id),
            ("platform.client_secret", &platform.client_secret),
            ("platform.password", &platform.password),
            ("platform.username", &platform.username),
            ("platform.user_agent", &platform.user_agent),
            ("platform.subreddits", &platform.subreddits),
            ("platform.feedback_subreddit", &platform.feedback_subreddit),
            ("platform.opt_in_thread", &platform.opt_in_thread),
        ] {
            if value.trim().is_empty() {
                bail!("{key} must not be empty");
            }
        }
        if platform.subreddits.split('+').any(|name| name.trim().is_empty()) {
            bail!("platform.subreddits has an empty entry: {:?}", platform.subreddits);
        }
        if self.store.path.as_os_str().is_empty() {
            bail!("store.path must not be empty");
        }
        if self.schedule.post_limit == 0 {
            bail!("schedule.post_limit must be at least 1");
        }
        if self.schedule.silent_drop_window == 0 {
            bail!("schedule.silent_drop_window must be at least 1");
        }
        Ok(())
    }

    pub fn credentials(&self) -> RedditCredentials {
        RedditCredentials {
            client_id: self.platform.client_id.clone(),
            client_secret: self.platform.client_secret.clone(),
            username: self.platform.username.clone(),
            password: self.platform.password.clone(),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.schedule.http_timeout_secs),
            user_agent: self.platform.user_agent.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
platform:
  client_id: abc
  client_secret: shh
  password: hunter2
  username: lightweaver_bot
  user_agent: "rsarb test agent"
  subreddits: "books+fantasy"
  feedback_subreddit: lightweaver_bot
  opt_in_thread: "https://www.reddit.com/r/lightweaver_bot/comments/udh3ao/opt_in/"
store:
  path: lightweaver.db
"#;

    #[test]
    fn schedule_defaults_apply() {
        let config = BotConfig::from_yaml_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.schedule.scan_cron, "0 * * * * *");
        assert_eq!(config.schedule.roster_cron, "0 0 * * * *");
        assert_eq!(config.schedule.silent_drop_window, 5);
        assert_eq!(config.http_client_config().timeout, Duration::from_secs(20));
        assert_eq!(config.store.path, PathBuf::from("lightweaver.db"));
    }

    #[test]
    fn missing_keys_are_rejected() {
        let without_thread = MINIMAL.replace(
            "  opt_in_thread: \"https://www.reddit.com/r/lightweaver_bot/comments/udh3ao/opt_in/\"\n",
            "",
        );
        assert!(BotConfig::from_yaml_str(&without_thread).is_err());

        let unknown = format!("{MINIMAL}extra: 1\n");
        assert!(BotConfig::from_yaml_str(&unknown).is_err());
    }

    #[test]
    fn empty_values_fail_validation() {
        let config = BotConfig::from_yaml_str(&MINIMAL.replace("client_id: abc", "client_id: \"\"")).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("platform.client_id"));

        let config = BotConfig::from_yaml_str(&MINIMAL.replace("books+fantasy", "books++fantasy")).unwrap();
        assert!(config.validate().is_err());

        let config = BotConfig::from_yaml_str(&format!("{MINIMAL}schedule:\n  silent_drop_window: 0\n")).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn secrets_can_come_from_the_environment() {
        let mut config = BotConfig::from_yaml_str(MINIMAL).unwrap();
        config.apply_env_overrides(|key| match key {
            CLIENT_SECRET_ENV => Some("from-env".to_string()),
            _ => None,
        });
        assert_eq!(config.platform.client_secret, "from-env");
        assert_eq!(config.platform.password, "hunter2");
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = BotConfig::from_file(dir.path().join("absent.yaml")).await.unwrap_err();
        assert!(err.to_string().contains("reading config"));
    }
}
