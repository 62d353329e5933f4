//! Agent configuration.
//!
//! [`AgentConfig`] is read once from a YAML file at startup and is immutable
//! afterwards. Durations are written as integer milliseconds. Every field has
//! a default, so a minimal file only names the identity:
//!
//! ```yaml
//! team_id: team-1
//! uploader_uid: uid-0b4c2a4e-4a2f-4a8e-9a43-5f1f3a0d2b11
//! ak: AKEXAMPLE
//! sk: <output of `corsair encode-sk`>
//! remote_host: https://ingest.example.com
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::auth::AuthContext;
use crate::client::SOURCE_CHECK_PATH;
use crate::error::ConfigError;
use crate::gate::{RejectAction, RejectPolicy};
use crate::queue::QueueConfig;
use crate::sample::LabelSet;
use crate::secret::decode_secret;

/// Path of the write endpoint, relative to the remote host.
pub const WRITE_PATH: &str = "/v1/write";

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "corsair.yml";

/// Complete agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Account the data belongs to.
    pub team_id: String,
    /// Unique id of this installation, `uid-<uuid>`.
    pub uploader_uid: String,
    /// Access key.
    pub ak: String,
    /// Obfuscated secret key, see [`crate::secret`].
    pub sk: String,
    /// Host identifier reported to the remote sink.
    pub host: String,
    /// Base URL of the remote sink.
    pub remote_host: String,
    /// Exposition endpoint to scrape.
    pub scrape_url: String,
    /// Time between scrapes.
    #[serde(with = "duration_ms")]
    pub scrape_interval: Duration,
    /// Bound on a single scrape.
    #[serde(with = "duration_ms")]
    pub scrape_timeout: Duration,
    /// Bound on a single remote request.
    #[serde(with = "duration_ms")]
    pub remote_timeout: Duration,
    /// How long shutdown waits for shards to flush.
    #[serde(with = "duration_ms")]
    pub flush_deadline: Duration,
    /// Reaction to an identity rejection.
    pub on_reject: RejectAction,
    /// Pause length when `on_reject` is `pause`.
    #[serde(with = "duration_ms")]
    pub reject_pause: Duration,
    /// Labels added to every series that does not already carry them.
    pub external_labels: BTreeMap<String, String>,
    /// Queue and batching parameters.
    pub queue: QueueConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            team_id: String::new(),
            uploader_uid: String::new(),
            ak: String::new(),
            sk: String::new(),
            host: "default".to_string(),
            remote_host: String::new(),
            scrape_url: "http://127.0.0.1:9100/metrics".to_string(),
            scrape_interval: Duration::from_secs(60),
            scrape_timeout: Duration::from_secs(10),
            remote_timeout: Duration::from_secs(30),
            flush_deadline: Duration::from_secs(60),
            on_reject: RejectAction::Halt,
            reject_pause: Duration::from_secs(3600),
            external_labels: BTreeMap::new(),
            queue: QueueConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Reads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if
    /// [`validate`](Self::validate) fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as YAML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if serialization or the write fails.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = serde_yaml::to_string(self).map_err(|e| ConfigError::Serialize { source: e })?;
        fs::write(path, text).map_err(|e| ConfigError::Write {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Checks that the configuration can run a pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field, or
    /// [`ConfigError::Secret`] if `sk` does not decode.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty("team_id", &self.team_id)?;
        require_non_empty("ak", &self.ak)?;
        require_non_empty("sk", &self.sk)?;
        decode_secret(&self.sk)?;

        require_url("remote_host", &self.remote_host)?;
        require_url("scrape_url", &self.scrape_url)?;

        for (field, value) in [
            ("scrape_interval", self.scrape_interval),
            ("scrape_timeout", self.scrape_timeout),
            ("remote_timeout", self.remote_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        self.queue.validate()
    }

    /// URL batches are posted to.
    pub fn write_url(&self) -> String {
        format!("{}{WRITE_PATH}", self.remote_host.trim_end_matches('/'))
    }

    /// URL of the identity check.
    pub fn source_check_url(&self) -> String {
        format!("{}{SOURCE_CHECK_PATH}", self.remote_host.trim_end_matches('/'))
    }

    /// Builds the request identity, decoding the secret key and looking up
    /// the machine host name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Secret`] if `sk` does not decode.
    pub fn auth_context(&self) -> Result<AuthContext, ConfigError> {
        let secret_key = decode_secret(&self.sk)?;
        let host_name = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(AuthContext::new(
            &self.team_id,
            &self.uploader_uid,
            &self.host,
            host_name,
            &self.ak,
            secret_key,
        ))
    }

    /// The rejection policy in effect.
    pub fn reject_policy(&self) -> RejectPolicy {
        RejectPolicy::new(self.on_reject, self.reject_pause)
    }

    /// External labels as a [`LabelSet`].
    pub fn external_labels(&self) -> LabelSet {
        self.external_labels
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect()
    }
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}

fn require_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::Invalid {
        field,
        reason: format!("'{value}' is not a valid URL: {e}"),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::Invalid {
            field,
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

/// Serde helpers for durations stored as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::encode_secret;

    fn valid_config() -> AgentConfig {
        AgentConfig {
            team_id: "team-1".to_string(),
            uploader_uid: "uid-1".to_string(),
            ak: "AK".to_string(),
            sk: encode_secret("secret").unwrap(),
            remote_host: "https://ingest.example.com/".to_string(),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.scrape_url, "http://127.0.0.1:9100/metrics");
        assert_eq!(config.scrape_interval, Duration::from_secs(60));
        assert_eq!(config.flush_deadline, Duration::from_secs(60));
        assert_eq!(config.remote_timeout, Duration::from_secs(30));
        assert_eq!(config.on_reject, RejectAction::Halt);
        assert_eq!(config.queue, QueueConfig::default());
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = "team_id: t\nak: a\nsk: s\nremote_host: http://r\n";
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.team_id, "t");
        assert_eq!(config.queue.capacity, 10_000);
        assert_eq!(config.host, "default");
    }

    #[test]
    fn test_durations_are_milliseconds() {
        let yaml = "scrape_interval: 1500\nqueue:\n  batch_send_deadline: 250\n";
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.scrape_interval, Duration::from_millis(1500));
        assert_eq!(config.queue.batch_send_deadline, Duration::from_millis(250));
        assert_eq!(config.queue.max_retries, 3);
    }

    #[test]
    fn test_on_reject_parses() {
        let config: AgentConfig = serde_yaml::from_str("on_reject: pause\nreject_pause: 1000\n").unwrap();
        assert_eq!(config.reject_policy(), RejectPolicy::Pause(Duration::from_secs(1)));
    }

    #[test]
    fn test_urls() {
        let config = valid_config();
        assert_eq!(config.write_url(), "https://ingest.example.com/v1/write");
        assert_eq!(
            config.source_check_url(),
            "https://ingest.example.com/v1/issue-source"
        );
    }

    #[test]
    fn test_validate() {
        assert!(valid_config().validate().is_ok());

        let mut config = valid_config();
        config.team_id.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "team_id", .. })
        ));

        let mut config = valid_config();
        config.remote_host = "not a url".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "remote_host", .. })
        ));

        let mut config = valid_config();
        config.sk = "plain-secret".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Secret { .. })));

        let mut config = valid_config();
        config.queue.shards = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "queue.shards", .. })
        ));
    }

    #[test]
    fn test_auth_context_decodes_secret() {
        let ctx = valid_config().auth_context().unwrap();
        assert_eq!(ctx.team_id, "team-1");
        assert_eq!(ctx.access_key, "AK");
        let header = ctx.authorization("POST", b"", "ct", "date").unwrap();
        let expected = crate::auth::sign("secret", "POST", b"", "ct", "date", "team-1").unwrap();
        assert_eq!(header, format!("corsair AK:{expected}"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corsair.yml");

        let mut config = valid_config();
        config
            .external_labels
            .insert("region".to_string(), "eu".to_string());
        config.save(&path).unwrap();

        let loaded = AgentConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.external_labels().get("region"), Some("eu"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            AgentConfig::load(dir.path().join("absent.yml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
