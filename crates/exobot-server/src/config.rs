//! Server configuration loading from file and environment variables.

use exobot_voice::{LlmConfig, SessionSettings, SttConfig, TtsConfig, VadConfig};
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Call behaviour.
    #[serde(default)]
    pub call: CallConfig,

    #[serde(default)]
    pub vad: VadConfig,

    #[serde(default)]
    pub stt: SttConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub tts: TtsConfig,

    /// Outbound calling through the Exotel REST API.
    #[serde(default)]
    pub outbound: OutboundConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "exobot_voice=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Per-call pipeline settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CallConfig {
    /// Sample rate the pipeline runs at.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Sample rate of the Exotel media stream.
    #[serde(default = "default_sample_rate")]
    pub exotel_sample_rate: u32,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Spoken when a call connects. Empty disables the greeting.
    #[serde(default = "default_greeting")]
    pub greeting: String,

    #[serde(default = "default_true")]
    pub allow_interruptions: bool,

    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    #[serde(default = "default_true")]
    pub enable_usage_metrics: bool,

    /// Seconds without speech or bot output before a call is ended. 0 disables.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// How long to wait for more transcript before answering.
    #[serde(default = "default_user_turn_timeout_ms")]
    pub user_turn_timeout_ms: u64,

    /// Length of each outgoing media frame.
    #[serde(default = "default_output_chunk_ms")]
    pub output_chunk_ms: u64,

    /// Context messages kept besides the system prompt.
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,
}

/// Outbound call settings.
#[derive(Debug, Clone, Deserialize)]
pub struct OutboundConfig {
    /// Exotel API host, e.g. `api.exotel.com` or `api.in.exotel.com`.
    #[serde(default = "default_subdomain")]
    pub subdomain: String,

    /// Full API base URL. Takes precedence over `subdomain`.
    #[serde(default)]
    pub api_base: Option<String>,

    /// Reject numbers that do not start with `+`.
    #[serde(default = "default_true")]
    pub require_e164: bool,

    /// Accepted number prefixes. Empty allows every number.
    #[serde(default = "default_allowed_country_codes")]
    pub allowed_country_codes: Vec<String>,

    /// Sent as `CustomField` when a request does not carry one.
    #[serde(default)]
    pub default_custom_field: Option<String>,

    /// Maximum call duration.
    #[serde(default = "default_call_time_limit_secs")]
    pub call_time_limit_secs: u64,

    /// How long Exotel lets the customer's phone ring.
    #[serde(default = "default_ring_timeout_secs")]
    pub ring_timeout_secs: u64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8765
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_sample_rate() -> u32 {
    8000
}

fn default_system_prompt() -> String {
    SessionSettings::default().system_prompt
}

fn default_greeting() -> String {
    SessionSettings::default().greeting
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_user_turn_timeout_ms() -> u64 {
    800
}

fn default_output_chunk_ms() -> u64 {
    100
}

fn default_max_context_messages() -> usize {
    40
}

fn default_subdomain() -> String {
    "api.exotel.com".to_string()
}

fn default_allowed_country_codes() -> Vec<String> {
    vec!["+91".to_string()]
}

fn default_call_time_limit_secs() -> u64 {
    600
}

fn default_ring_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            exotel_sample_rate: default_sample_rate(),
            system_prompt: default_system_prompt(),
            greeting: default_greeting(),
            allow_interruptions: true,
            enable_metrics: true,
            enable_usage_metrics: true,
            idle_timeout_secs: default_idle_timeout_secs(),
            user_turn_timeout_ms: default_user_turn_timeout_ms(),
            output_chunk_ms: default_output_chunk_ms(),
            max_context_messages: default_max_context_messages(),
        }
    }
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            subdomain: default_subdomain(),
            api_base: None,
            require_e164: true,
            allowed_country_codes: default_allowed_country_codes(),
            default_custom_field: None,
            call_time_limit_secs: default_call_time_limit_secs(),
            ring_timeout_secs: default_ring_timeout_secs(),
        }
    }
}

impl OutboundConfig {
    /// Base URL of the Exotel REST API, without a trailing slash.
    pub fn api_base(&self) -> String {
        match &self.api_base {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!("https://{}", self.subdomain),
        }
    }
}

impl Config {
    /// Pipeline settings for a new call.
    pub fn session_settings(&self) -> SessionSettings {
        let call = &self.call;
        SessionSettings {
            sample_rate: call.sample_rate,
            system_prompt: call.system_prompt.clone(),
            greeting: call.greeting.clone(),
            allow_interruptions: call.allow_interruptions,
            vad: self.vad.enabled.then(|| self.vad.clone()),
            enable_metrics: call.enable_metrics,
            enable_usage_metrics: call.enable_usage_metrics,
            idle_timeout: (call.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(call.idle_timeout_secs)),
            user_turn_timeout: Duration::from_millis(call.user_turn_timeout_ms),
            output_chunk: Duration::from_millis(call.output_chunk_ms),
            max_context_messages: call.max_context_messages,
        }
    }

    /// Copies the provider API keys into the provider sections.
    pub fn apply_credentials(&mut self, credentials: &Credentials) {
        self.stt.api_key = credentials.deepgram_api_key.clone();
        self.llm.api_key = credentials.openai_api_key.clone();
        self.tts.api_key = credentials.cartesia_api_key.clone();
    }
}

/// Environment variables the server cannot run without.
pub const REQUIRED_ENV_VARS: [&str; 8] = [
    "EXOTEL_API_KEY",
    "EXOTEL_API_TOKEN",
    "EXOTEL_ACCOUNT_SID",
    "EXOTEL_CALLER_ID",
    "EXOTEL_APP_ID",
    "OPENAI_API_KEY",
    "DEEPGRAM_API_KEY",
    "CARTESIA_API_KEY",
];

/// Secrets and account identifiers read from the environment.
#[derive(Clone, Default)]
pub struct Credentials {
    pub exotel_api_key: String,
    pub exotel_api_token: String,
    pub exotel_account_sid: String,
    pub exotel_caller_id: String,
    pub exotel_app_id: String,
    pub openai_api_key: String,
    pub deepgram_api_key: String,
    pub cartesia_api_key: String,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads every credential through `lookup`. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };
        Self {
            exotel_api_key: get("EXOTEL_API_KEY"),
            exotel_api_token: get("EXOTEL_API_TOKEN"),
            exotel_account_sid: get("EXOTEL_ACCOUNT_SID"),
            exotel_caller_id: get("EXOTEL_CALLER_ID"),
            exotel_app_id: get("EXOTEL_APP_ID"),
            openai_api_key: get("OPENAI_API_KEY"),
            deepgram_api_key: get("DEEPGRAM_API_KEY"),
            cartesia_api_key: get("CARTESIA_API_KEY"),
        }
    }

    /// Names of the required variables that are not set, in declaration order.
    pub fn missing(&self) -> Vec<&'static str> {
        let values = [
            &self.exotel_api_key,
            &self.exotel_api_token,
            &self.exotel_account_sid,
            &self.exotel_caller_id,
            &self.exotel_app_id,
            &self.openai_api_key,
            &self.deepgram_api_key,
            &self.cartesia_api_key,
        ];
        REQUIRED_ENV_VARS
            .iter()
            .zip(values)
            .filter(|(_, value)| value.is_empty())
            .map(|(name, _)| *name)
            .collect()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("exotel_api_key", &"[REDACTED]")
            .field("exotel_api_token", &"[REDACTED]")
            .field("exotel_account_sid", &self.exotel_account_sid)
            .field("exotel_caller_id", &self.exotel_caller_id)
            .field("exotel_app_id", &self.exotel_app_id)
            .field("openai_api_key", &"[REDACTED]")
            .field("deepgram_api_key", &"[REDACTED]")
            .field("cartesia_api_key", &"[REDACTED]")
            .finish()
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration parsed but is unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `EXOBOT_HOST` overrides `server.host`
/// - `EXOBOT_PORT` overrides `server.port`
/// - `PORT` overrides `server.port` and wins over `EXOBOT_PORT`
/// - `EXOBOT_LOG_LEVEL` overrides `logging.level`
/// - `EXOBOT_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `EXOTEL_SUBDOMAIN` overrides `outbound.subdomain`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if the result fails validation.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;

    Ok(config)
}

/// Applies the environment overrides listed on [`load_config`].
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("EXOBOT_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    for key in ["EXOBOT_PORT", "PORT"] {
        if let Some(port) = lookup(key) {
            if let Ok(parsed) = port.trim().parse() {
                config.server.port = parsed;
            }
        }
    }
    if let Some(level) = lookup("EXOBOT_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("EXOBOT_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(subdomain) = lookup("EXOTEL_SUBDOMAIN") {
        if !subdomain.trim().is_empty() {
            config.outbound.subdomain = subdomain.trim().to_string();
        }
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.call.sample_rate == 0 || config.call.exotel_sample_rate == 0 {
        return Err(ConfigError::Invalid(
            "call sample rates must be positive".to_string(),
        ));
    }
    if config.call.output_chunk_ms == 0 {
        return Err(ConfigError::Invalid(
            "call.output_chunk_ms must be positive".to_string(),
        ));
    }
    config
        .vad
        .validate()
        .map_err(|e| ConfigError::Invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_listen_on_8765() {
        let config = Config::default();
        assert_eq!(config.server.port, 8765);
        assert_eq!(config.server.host.to_string(), "0.0.0.0");
        assert_eq!(config.outbound.allowed_country_codes, vec!["+91"]);
        assert_eq!(config.outbound.api_base(), "https://api.exotel.com");
        assert!(config.vad.enabled);
    }

    #[test]
    fn loads_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9000

[call]
greeting = "Namaste!"
idle_timeout_secs = 0

[vad]
enabled = false

[outbound]
allowed_country_codes = []
api_base = "http://127.0.0.1:9999/"
"#
        )
        .unwrap();

        let config = load_config(file.path().to_str()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.call.greeting, "Namaste!");
        assert_eq!(config.call.sample_rate, 8000);
        assert!(config.outbound.allowed_country_codes.is_empty());
        assert_eq!(config.outbound.api_base(), "http://127.0.0.1:9999");

        let settings = config.session_settings();
        assert!(settings.vad.is_none());
        assert!(settings.idle_timeout.is_none());
        assert_eq!(settings.greeting, "Namaste!");
    }

    #[test]
    fn missing_file_means_defaults() {
        let config = load_config(Some("/nonexistent/exobot.toml")).unwrap();
        assert_eq!(config.server.port, 8765);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();
        assert!(matches!(
            load_config(file.path().to_str()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn zero_output_chunk_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[call]\noutput_chunk_ms = 0").unwrap();
        assert!(matches!(
            load_config(file.path().to_str()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        apply_env_overrides(
            &mut config,
            lookup(&[
                ("EXOBOT_HOST", "127.0.0.1"),
                ("EXOBOT_PORT", "9100"),
                ("EXOBOT_LOG_LEVEL", "debug"),
                ("EXOBOT_LOG_JSON", "1"),
                ("EXOTEL_SUBDOMAIN", "api.in.exotel.com"),
            ]),
        );
        assert_eq!(config.server.host.to_string(), "127.0.0.1");
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert_eq!(config.outbound.api_base(), "https://api.in.exotel.com");
    }

    #[test]
    fn legacy_port_wins() {
        let mut config = Config::default();
        apply_env_overrides(
            &mut config,
            lookup(&[("EXOBOT_PORT", "9100"), ("PORT", "8080")]),
        );
        assert_eq!(config.server.port, 8080);

        let mut config = Config::default();
        apply_env_overrides(&mut config, lookup(&[("PORT", "not-a-port")]));
        assert_eq!(config.server.port, 8765);
    }

    #[test]
    fn credentials_list_missing_variables() {
        let credentials = Credentials::from_lookup(lookup(&[
            ("EXOTEL_API_KEY", "key"),
            ("EXOTEL_API_TOKEN", "token"),
            ("EXOTEL_ACCOUNT_SID", "acme"),
            ("EXOTEL_CALLER_ID", "08012345678"),
            ("EXOTEL_APP_ID", "   "),
            ("OPENAI_API_KEY", "sk"),
        ]));
        assert_eq!(
            credentials.missing(),
            vec!["EXOTEL_APP_ID", "DEEPGRAM_API_KEY", "CARTESIA_API_KEY"]
        );

        let all: Vec<(&str, &str)> = REQUIRED_ENV_VARS.iter().map(|k| (*k, "x")).collect();
        assert!(Credentials::from_lookup(lookup(&all)).missing().is_empty());
    }

    #[test]
    fn credentials_debug_redacts_secrets() {
        let credentials = Credentials {
            exotel_api_token: "super-secret-token".to_string(),
            openai_api_key: "sk-live-123".to_string(),
            exotel_account_sid: "acme".to_string(),
            ..Default::default()
        };
        let debug = format!("{:?}", credentials);
        assert!(!debug.contains("super-secret-token"));
        assert!(!debug.contains("sk-live-123"));
        assert!(debug.contains("acme"));
    }

    #[test]
    fn apply_credentials_fills_provider_keys() {
        let mut config = Config::default();
        config.apply_credentials(&Credentials {
            deepgram_api_key: "dg".to_string(),
            openai_api_key: "sk".to_string(),
            cartesia_api_key: "ca".to_string(),
            ..Default::default()
        });
        assert_eq!(config.stt.api_key, "dg");
        assert_eq!(config.llm.api_key, "sk");
        assert_eq!(config.tts.api_key, "ca");
    }
}
