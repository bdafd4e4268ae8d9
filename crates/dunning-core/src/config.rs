use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{FixedOffset, NaiveTime};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub reminders: ReminderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// How long `POST /v1/connections` waits for the pairing or ready outcome.
    #[serde(default = "default_connect_wait_seconds")]
    pub connect_wait_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            connect_wait_seconds: default_connect_wait_seconds(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_addr
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
                field: "server.bind_addr".to_string(),
                message: e.to_string(),
            })
    }

    pub fn connect_wait(&self) -> Duration {
        Duration::from_secs(self.connect_wait_seconds)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    /// libSQL file path; in-memory when unset.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_credentials_dir")]
    pub credentials_dir: String,
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    #[serde(default = "default_reconnect_delay_seconds")]
    pub reconnect_delay_seconds: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            credentials_dir: default_credentials_dir(),
            bridge_url: default_bridge_url(),
            reconnect_delay_seconds: default_reconnect_delay_seconds(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl ChannelConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReminderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Local wall-clock times, `"HH:MM"`.
    #[serde(default = "default_times")]
    pub times: Vec<String>,
    /// Offset of the local wall clock from UTC, `"+HH:MM"` or `"-HH:MM"`.
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    /// Used for clients that have no template of their own.
    #[serde(default = "default_template")]
    pub default_template: String,
    #[serde(default = "default_currency_symbol")]
    pub currency_symbol: String,
    /// Ask the network whether each destination exists before sending.
    #[serde(default = "default_true")]
    pub verify_destination: bool,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            times: default_times(),
            utc_offset: default_utc_offset(),
            lookback_days: default_lookback_days(),
            default_template: default_template(),
            currency_symbol: default_currency_symbol(),
            verify_destination: true,
        }
    }
}

impl ReminderConfig {
    pub fn parsed_times(&self) -> Result<Vec<NaiveTime>, ConfigError> {
        self.times
            .iter()
            .map(|raw| {
                NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(|e| {
                    ConfigError::InvalidValue {
                        field: "reminders.times".to_string(),
                        message: format!("{raw:?}: {e}"),
                    }
                })
            })
            .collect()
    }

    pub fn parsed_offset(&self) -> Result<FixedOffset, ConfigError> {
        parse_utc_offset(&self.utc_offset).ok_or_else(|| ConfigError::InvalidValue {
            field: "reminders.utc_offset".to_string(),
            message: format!("{:?} is not of the form +HH:MM or -HH:MM", self.utc_offset),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `"pretty"` or `"json"`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    bind_addr: Option<String>,
    database_path: Option<String>,
    credentials_dir: Option<String>,
    bridge_url: Option<String>,
    reminder_times: Option<String>,
    utc_offset: Option<String>,
    log_level: Option<String>,
    log_format: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_connect_wait_seconds() -> u64 {
    20
}

fn default_credentials_dir() -> String {
    "data/credentials".to_string()
}

fn default_bridge_url() -> String {
    "http://127.0.0.1:8085".to_string()
}

fn default_reconnect_delay_seconds() -> u64 {
    5
}

fn default_event_capacity() -> usize {
    64
}

fn default_times() -> Vec<String> {
    vec!["08:00".to_string(), "09:00".to_string()]
}

fn default_utc_offset() -> String {
    "-03:00".to_string()
}

fn default_lookback_days() -> u32 {
    3
}

fn default_template() -> String {
    "Olá, {nome}! Seu pagamento de {valor} referente a {produto} vence em {vencimento}."
        .to_string()
}

fn default_currency_symbol() -> String {
    "R$".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const VALID_LOG_FORMATS: &[&str] = &["pretty", "json"];

/// Load configuration from `path`, merging `DUNNING_*` environment overrides.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };
    load_config_from_str(&contents)
}

/// Parse configuration from a TOML string, merging environment overrides.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

/// Defaults plus environment overrides, for deployments without a file.
pub fn load_config_from_env() -> Result<Config, ConfigError> {
    load_config_from_str("")
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        bind_addr: std::env::var("DUNNING_BIND_ADDR").ok(),
        database_path: std::env::var("DUNNING_DB_PATH").ok(),
        credentials_dir: std::env::var("DUNNING_CREDENTIALS_DIR").ok(),
        bridge_url: std::env::var("DUNNING_BRIDGE_URL").ok(),
        reminder_times: std::env::var("DUNNING_REMINDER_TIMES").ok(),
        utc_offset: std::env::var("DUNNING_UTC_OFFSET").ok(),
        log_level: std::env::var("DUNNING_LOG_LEVEL").ok(),
        log_format: std::env::var("DUNNING_LOG_FORMAT").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) {
    if let Some(addr) = overrides.bind_addr {
        config.server.bind_addr = addr;
    }
    if let Some(path) = overrides.database_path {
        config.database.path = Some(path);
    }
    if let Some(dir) = overrides.credentials_dir {
        config.channel.credentials_dir = dir;
    }
    if let Some(url) = overrides.bridge_url {
        config.channel.bridge_url = url;
    }
    if let Some(times) = overrides.reminder_times {
        config.reminders.times = times
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
    }
    if let Some(offset) = overrides.utc_offset {
        config.reminders.utc_offset = offset;
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
    if let Some(format) = overrides.log_format {
        config.logging.format = format;
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    config.server.socket_addr()?;

    if config.channel.reconnect_delay_seconds == 0 {
        return Err(ConfigError::InvalidValue {
            field: "channel.reconnect_delay_seconds".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    if config.reminders.times.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "reminders.times".to_string(),
            message: "at least one time of day is required".to_string(),
        });
    }
    config.reminders.parsed_times()?;
    config.reminders.parsed_offset()?;

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }
    if !VALID_LOG_FORMATS.contains(&config.logging.format.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.format".to_string(),
            message: format!("must be one of: {}", VALID_LOG_FORMATS.join(", ")),
        });
    }

    Ok(())
}

/// Parse `"+HH:MM"`, `"-HH:MM"` or `"Z"`.
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }

    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':')?;
    let two_digits = |part: &str| part.len() == 2 && part.bytes().all(|b| b.is_ascii_digit());
    if !two_digits(hours) || !two_digits(minutes) {
        return None;
    }
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_without_env(toml_str: &str) -> Result<Config, ConfigError> {
        load_config_from_str_with_overrides(toml_str, ConfigOverrides::default())
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse_without_env("").unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.server.connect_wait(), Duration::from_secs(20));
        assert!(config.database.path.is_none());
        assert_eq!(config.channel.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.reminders.lookback_days, 3);
        assert_eq!(config.reminders.times, vec!["08:00", "09:00"]);
        assert_eq!(config.reminders.currency_symbol, "R$");
        assert!(config.reminders.verify_destination);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn parses_full_config() {
        let config = parse_without_env(
            r#"
[server]
bind_addr = "127.0.0.1:8080"
connect_wait_seconds = 5

[database]
path = "/var/lib/dunning/dunning.db"

[channel]
credentials_dir = "/var/lib/dunning/creds"
bridge_url = "http://bridge:9000"
reconnect_delay_seconds = 10

[reminders]
times = ["07:30"]
utc_offset = "+01:00"
lookback_days = 5

[logging]
level = "debug"
format = "json"
"#,
        )
        .unwrap();

        assert_eq!(config.server.socket_addr().unwrap().port(), 8080);
        assert_eq!(
            config.database.path.as_deref(),
            Some("/var/lib/dunning/dunning.db")
        );
        assert_eq!(config.channel.bridge_url, "http://bridge:9000");
        assert_eq!(
            config.reminders.parsed_times().unwrap(),
            vec![NaiveTime::from_hms_opt(7, 30, 0).unwrap()]
        );
        assert_eq!(
            config.reminders.parsed_offset().unwrap(),
            FixedOffset::east_opt(3600).unwrap()
        );
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn invalid_toml_reports_position() {
        let err = parse_without_env("[server\nbind_addr = 1").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidToml { line: 1, .. }));
    }

    #[test]
    fn rejects_bad_time_of_day() {
        let err = parse_without_env("[reminders]\ntimes = [\"25:00\"]").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "reminders.times"));
    }

    #[test]
    fn rejects_zero_reconnect_delay() {
        let err = parse_without_env("[channel]\nreconnect_delay_seconds = 0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "channel.reconnect_delay_seconds"));
    }

    #[test]
    fn rejects_unknown_log_level() {
        let err = parse_without_env("[logging]\nlevel = \"loud\"").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "logging.level"));
    }

    #[test]
    fn overrides_take_precedence() {
        let overrides = ConfigOverrides {
            database_path: Some("/tmp/override.db".to_string()),
            reminder_times: Some("06:00, 18:30".to_string()),
            utc_offset: Some("Z".to_string()),
            ..Default::default()
        };
        let config = load_config_from_str_with_overrides("", overrides).unwrap();
        assert_eq!(config.database.path.as_deref(), Some("/tmp/override.db"));
        assert_eq!(config.reminders.times, vec!["06:00", "18:30"]);
        assert_eq!(
            config.reminders.parsed_offset().unwrap(),
            FixedOffset::east_opt(0).unwrap()
        );
    }

    #[test]
    fn parses_utc_offsets() {
        assert_eq!(parse_utc_offset("-03:00"), FixedOffset::west_opt(3 * 3600));
        assert_eq!(parse_utc_offset("+05:30"), FixedOffset::east_opt(5 * 3600 + 1800));
        assert_eq!(parse_utc_offset("03:00"), None);
        assert_eq!(parse_utc_offset("+3:00"), None);
        assert_eq!(parse_utc_offset("+24:00"), None);
        assert_eq!(parse_utc_offset("+-3:00"), None);
        assert_eq!(parse_utc_offset("-+3:00"), None);
        assert_eq!(parse_utc_offset("+03:-5"), None);
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config_from(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
