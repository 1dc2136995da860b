// Local crates
use crate::{
    collector::{
        cycle::CollectionOptions,
        filter::{AUDIT_EVENT_TYPES, FilterError, validate_event_type},
        paginator::MAX_PAGE_SIZE,
    },
    gateway::{
        gateway::{ConnectionParams, Credentials},
        vijson::DEFAULT_API_RELEASE,
    },
    retry::retry::{RetryPolicy, RetryPolicyError},
    sink::sink::SinkMode,
};

// External crates
use chrono::TimeDelta;
use config::{Config, Environment, File, FileFormat, Map};
use dialoguer::{Input, Password};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::instrument;

/// Prefix of the environment variables read into `Settings`.
pub const ENV_PREFIX: &str = "VMWARELOG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("invalid retry policy: {0}")]
    Retry(#[from] RetryPolicyError),
    #[error("no {0} configured and no terminal to prompt on")]
    MissingCredential(&'static str),
    #[error("failed to read credentials: {0}")]
    Prompt(#[from] dialoguer::Error),
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VcenterSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub tls_verify: bool,
    pub pool_timeout_secs: u64,
    pub api_release: String,
}

impl fmt::Debug for VcenterSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VcenterSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tls_verify", &self.tls_verify)
            .field("pool_timeout_secs", &self.pool_timeout_secs)
            .field("api_release", &self.api_release)
            .finish()
    }
}

impl Default for VcenterSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 443,
            username: None,
            password: None,
            tls_verify: true,
            pool_timeout_secs: 30,
            api_release: DEFAULT_API_RELEASE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionSettings {
    pub lookback_minutes: i64,
    pub page_size: usize,
    pub max_events_per_cycle: Option<usize>,
    pub event_types: Vec<String>,
    pub audit_preset: bool,
    pub interval_minutes: u64,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            lookback_minutes: 60,
            page_size: MAX_PAGE_SIZE,
            max_events_per_cycle: None,
            event_types: Vec::new(),
            audit_preset: false,
            interval_minutes: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// `0` retries until the process is interrupted.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: Option<u64>,
    pub retry_jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: Some(60_000),
            retry_jitter: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkSettings {
    pub path: PathBuf,
    pub mode: SinkMode,
    pub echo_to_console: bool,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("vmware-events.log"),
            mode: SinkMode::default(),
            echo_to_console: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Hourly,
    Daily,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub directory: PathBuf,
    pub file_name: String,
    pub level: String,
    pub json: bool,
    pub rotation: LogRotation,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            file_name: "vmwarelog.log".to_string(),
            level: "info".to_string(),
            json: false,
            rotation: LogRotation::Never,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub listen_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub vcenter: VcenterSettings,
    pub collection: CollectionSettings,
    pub retry: RetrySettings,
    pub sink: SinkSettings,
    pub logging: LoggingSettings,
    pub metrics: MetricsSettings,
}

/// Values given on the command line. They win over every other source.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub output: Option<PathBuf>,
    pub mode: Option<SinkMode>,
    pub lookback_minutes: Option<i64>,
    pub interval_minutes: Option<u64>,
    pub event_types: Vec<String>,
    pub audit: bool,
    pub insecure: bool,
    pub quiet: bool,
}

impl Settings {
    /// Load settings from the TOML file, the process environment and `overrides`.
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(path: impl AsRef<Path>, overrides: &SettingsOverrides) -> Result<Self, ConfigError> {
        Self::load_with_env(path, overrides, None)
    }

    /// Same as [`Settings::load`], reading variables from `env` instead of the
    /// process environment when given.
    #[instrument(
        name = "config_loader",
        target = "helpers::load_config",
        level = "trace",
        skip_all
    )]
    pub fn load_with_env(
        path: impl AsRef<Path>,
        overrides: &SettingsOverrides,
        env: Option<Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        tracing::trace!(
            configuration_file_path = %path.display(),
            "Loading vmwarelog configuration"
        );

        let builder = Config::builder()
            .add_source(
                File::new(&path.to_string_lossy(), FileFormat::Toml).required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("collection.event_types")
                    .source(env),
            )
            .set_override_option("vcenter.host", overrides.host.clone())?
            .set_override_option("vcenter.port", overrides.port.map(i64::from))?
            .set_override_option("vcenter.username", overrides.username.clone())?
            .set_override_option(
                "sink.path",
                overrides
                    .output
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
            )?
            .set_override_option(
                "sink.mode",
                overrides.mode.map(|m| match m {
                    SinkMode::Plain => "plain",
                    SinkMode::Structured => "structured",
                }),
            )?
            .set_override_option("collection.lookback_minutes", overrides.lookback_minutes)?
            .set_override_option(
                "collection.interval_minutes",
                overrides.interval_minutes.map(|m| m as i64),
            )?
            .set_override_option(
                "collection.event_types",
                (!overrides.event_types.is_empty()).then(|| overrides.event_types.clone()),
            )?
            .set_override_option("collection.audit_preset", overrides.audit.then_some(true))?
            .set_override_option("vcenter.tls_verify", overrides.insecure.then_some(false))?
            .set_override_option("sink.echo_to_console", overrides.quiet.then_some(false))?;

        let settings: Settings = match builder.build().and_then(Config::try_deserialize) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load configuration");
                return Err(e.into());
            }
        };

        tracing::trace!("vmwarelog configuration loaded successfully");
        Ok(settings)
    }

    /// Reject settings that would fail only once the run has started.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vcenter.host.trim().is_empty() {
            return Err(invalid("vcenter.host", "a vCenter host is required"));
        }
        if self.vcenter.host.contains(['/', ' ']) {
            return Err(invalid("vcenter.host", "expected a host name or address, not a URL"));
        }
        if self.vcenter.port == 0 {
            return Err(invalid("vcenter.port", "must be between 1 and 65535"));
        }
        if self.vcenter.pool_timeout_secs == 0 {
            return Err(invalid("vcenter.pool_timeout_secs", "must be positive"));
        }
        if self.collection.lookback_minutes <= 0 {
            return Err(FilterError::NonPositiveLookback(self.lookback()).into());
        }
        if !(1..=MAX_PAGE_SIZE).contains(&self.collection.page_size) {
            return Err(invalid(
                "collection.page_size",
                format!("must be between 1 and {MAX_PAGE_SIZE}"),
            ));
        }
        if self.collection.max_events_per_cycle == Some(0) {
            return Err(invalid("collection.max_events_per_cycle", "must be positive when set"));
        }
        if self.collection.interval_minutes == 0 {
            return Err(invalid("collection.interval_minutes", "must be positive"));
        }
        for id in &self.collection.event_types {
            validate_event_type(id)?;
        }
        self.retry_policy().validate()?;
        Ok(())
    }

    /// Ask for whichever of username and password is missing.
    pub fn prompt_missing_credentials(&mut self) -> Result<(), ConfigError> {
        let interactive = std::io::stdin().is_terminal();

        if self.vcenter.username.as_deref().is_none_or(str::is_empty) {
            if !interactive {
                return Err(ConfigError::MissingCredential("username"));
            }
            let username: String = Input::new()
                .with_prompt(format!("Username for {}", self.vcenter.host))
                .interact_text()?;
            self.vcenter.username = Some(username);
        }

        if self.vcenter.password.is_none() {
            if !interactive {
                return Err(ConfigError::MissingCredential("password"));
            }
            let password = Password::new()
                .with_prompt(format!(
                    "Password for {}@{}",
                    self.vcenter.username.as_deref().unwrap_or_default(),
                    self.vcenter.host
                ))
                .interact()?;
            self.vcenter.password = Some(password);
        }

        Ok(())
    }

    pub fn lookback(&self) -> TimeDelta {
        TimeDelta::try_minutes(self.collection.lookback_minutes).unwrap_or(TimeDelta::MAX)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.collection.interval_minutes.saturating_mul(60))
    }

    /// Configured event types, with the audit preset merged in when enabled.
    pub fn event_types(&self) -> Vec<String> {
        let mut types = Vec::new();
        if self.collection.audit_preset {
            types.extend(AUDIT_EVENT_TYPES.iter().map(|t| t.to_string()));
        }
        for id in &self.collection.event_types {
            if !types.contains(id) {
                types.push(id.clone());
            }
        }
        types
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            multiplier: self.retry.backoff_factor,
            max_delay: self.retry.max_delay_ms.map(Duration::from_millis),
            jitter: self.retry.retry_jitter,
        }
    }

    pub fn collection_options(&self) -> CollectionOptions {
        CollectionOptions {
            page_size: self.collection.page_size,
            max_events: self.collection.max_events_per_cycle,
        }
    }

    /// Connection parameters for the gateway. Credentials must be resolved first.
    pub fn connection_params(&self) -> Result<ConnectionParams, ConfigError> {
        let username = self
            .vcenter
            .username
            .clone()
            .ok_or(ConfigError::MissingCredential("username"))?;
        let password = self
            .vcenter
            .password
            .clone()
            .ok_or(ConfigError::MissingCredential("password"))?;

        Ok(ConnectionParams {
            host: self.vcenter.host.clone(),
            port: self.vcenter.port,
            credentials: Credentials { username, password },
            tls_verify: self.vcenter.tls_verify,
            pool_timeout: Duration::from_secs(self.vcenter.pool_timeout_secs),
        })
    }

    /// Effective settings as TOML, without the password.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("vmwarelog.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn env(pairs: &[(&str, &str)]) -> Option<Map<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    const FILE: &str = r#"
[vcenter]
host = "vc-file.lab"
port = 8443
username = "file-user"

[collection]
lookback_minutes = 30
event_types = ["VmPoweredOnEvent"]
"#;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load_with_env(
            dir.path().join("absent.toml"),
            &SettingsOverrides::default(),
            env(&[]),
        )
        .unwrap();

        assert_eq!(settings.vcenter.port, 443);
        assert!(settings.vcenter.tls_verify);
        assert_eq!(settings.collection.lookback_minutes, 60);
        assert_eq!(settings.collection.page_size, 1000);
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.sink.mode, SinkMode::Structured);
    }

    #[test]
    fn environment_beats_file() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, FILE);

        let settings = Settings::load_with_env(
            &path,
            &SettingsOverrides::default(),
            env(&[
                ("VMWARELOG_VCENTER__HOST", "vc-env.lab"),
                ("VMWARELOG_COLLECTION__LOOKBACK_MINUTES", "45"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.vcenter.host, "vc-env.lab");
        assert_eq!(settings.vcenter.port, 8443);
        assert_eq!(settings.collection.lookback_minutes, 45);
        assert_eq!(settings.vcenter.username.as_deref(), Some("file-user"));
    }

    #[test]
    fn cli_overrides_beat_environment_and_file() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, FILE);
        let overrides = SettingsOverrides {
            host: Some("vc-cli.lab".into()),
            port: Some(9443),
            event_types: vec!["UserLoginSessionEvent".into()],
            insecure: true,
            quiet: true,
            mode: Some(SinkMode::Plain),
            ..Default::default()
        };

        let settings = Settings::load_with_env(
            &path,
            &overrides,
            env(&[("VMWARELOG_VCENTER__HOST", "vc-env.lab")]),
        )
        .unwrap();

        assert_eq!(settings.vcenter.host, "vc-cli.lab");
        assert_eq!(settings.vcenter.port, 9443);
        assert!(!settings.vcenter.tls_verify);
        assert!(!settings.sink.echo_to_console);
        assert_eq!(settings.sink.mode, SinkMode::Plain);
        assert_eq!(settings.collection.event_types, vec!["UserLoginSessionEvent"]);
    }

    #[test]
    fn unset_flags_leave_lower_sources_alone() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "[vcenter]\nhost = \"vc\"\ntls_verify = false\n");

        let settings = Settings::load_with_env(&path, &SettingsOverrides::default(), env(&[])).unwrap();

        assert!(!settings.vcenter.tls_verify);
    }

    fn valid() -> Settings {
        let mut settings = Settings::default();
        settings.vcenter.host = "vc.lab".into();
        settings
    }

    #[test]
    fn validation_accepts_defaults_with_a_host() {
        assert!(valid().validate().is_ok());
        assert!(matches!(
            Settings::default().validate(),
            Err(ConfigError::Invalid { field: "vcenter.host", .. })
        ));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut s = valid();
        s.collection.lookback_minutes = 0;
        assert!(matches!(
            s.validate(),
            Err(ConfigError::Filter(FilterError::NonPositiveLookback(_)))
        ));

        let mut s = valid();
        s.collection.page_size = 1001;
        assert!(matches!(
            s.validate(),
            Err(ConfigError::Invalid { field: "collection.page_size", .. })
        ));

        let mut s = valid();
        s.collection.event_types = vec!["Vm Powered".into()];
        assert!(matches!(
            s.validate(),
            Err(ConfigError::Filter(FilterError::InvalidEventType(_)))
        ));

        let mut s = valid();
        s.retry.backoff_factor = 0.5;
        assert!(matches!(s.validate(), Err(ConfigError::Retry(_))));
    }

    #[test]
    fn audit_preset_merges_without_duplicates() {
        let mut s = valid();
        s.collection.audit_preset = true;
        s.collection.event_types = vec![AUDIT_EVENT_TYPES[0].to_string(), "CustomEvent".into()];

        let types = s.event_types();

        assert_eq!(types.len(), AUDIT_EVENT_TYPES.len() + 1);
        assert_eq!(types.last().map(String::as_str), Some("CustomEvent"));
    }

    #[test]
    fn rendered_settings_never_contain_the_password() {
        let mut s = valid();
        s.vcenter.username = Some("admin".into());
        s.vcenter.password = Some("hunter2".into());

        let rendered = s.to_toml().unwrap();

        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn connection_params_need_credentials() {
        let mut s = valid();
        assert!(matches!(
            s.connection_params(),
            Err(ConfigError::MissingCredential("username"))
        ));

        s.vcenter.username = Some("admin".into());
        s.vcenter.password = Some("pw".into());
        let params = s.connection_params().unwrap();
        assert_eq!(params.port, 443);
        assert_eq!(params.pool_timeout, Duration::from_secs(30));
    }
}
