use gemini_realtime::DEFAULT_ENDPOINT;
use secrecy::SecretString;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{Level, info, warn};

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";

/// Cloud-function endpoints backing the HTTP tools.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FunctionUrls {
    pub weather: Option<String>,
    pub forecast: Option<String>,
    pub calendar: Option<String>,
    pub past_appointments: Option<String>,
}

impl FunctionUrls {
    /// `(environment variable, tool name, url)` for every endpoint.
    pub fn entries(&self) -> [(&'static str, &'static str, Option<&str>); 4] {
        [
            ("WEATHER_FUNCTION_URL", "get_weather", self.weather.as_deref()),
            (
                "FORECAST_FUNCTION_URL",
                "get_weather_forecast",
                self.forecast.as_deref(),
            ),
            (
                "CALENDAR_FUNCTION_URL",
                "get_next_appointment",
                self.calendar.as_deref(),
            ),
            (
                "PAST_APPOINTMENTS_FUNCTION_URL",
                "get_past_appointments",
                self.past_appointments.as_deref(),
            ),
        ]
    }

    /// The endpoint registered for `tool`, if any.
    pub fn for_tool(&self, tool: &str) -> Option<&str> {
        self.entries()
            .into_iter()
            .find(|(_, name, _)| *name == tool)
            .and_then(|(_, _, url)| url)
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub log_level: Level,
    pub google_api_key: Option<SecretString>,
    pub live_endpoint: String,
    pub model: String,
    pub voice: String,
    pub system_instructions_path: PathBuf,
    pub audio_output_dir: PathBuf,
    pub setup_timeout: Duration,
    pub idle_timeout: Duration,
    pub function_urls: FunctionUrls,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn seconds_var(name: &str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// A missing API key is not an error here: every session then fails with a
    /// configuration error instead.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str = var_or("BIND_ADDRESS", "0.0.0.0:8081");
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let live_endpoint = var_or("GEMINI_LIVE_ENDPOINT", DEFAULT_ENDPOINT);
        if !live_endpoint.starts_with("wss://") && !live_endpoint.starts_with("ws://") {
            return Err(ConfigError::InvalidValue(
                "GEMINI_LIVE_ENDPOINT".to_string(),
                "must be a ws:// or wss:// URL".to_string(),
            ));
        }

        Ok(Self {
            bind_address,
            log_level,
            google_api_key: optional_var("GOOGLE_API_KEY").map(SecretString::from),
            live_endpoint,
            model: var_or("MODEL", DEFAULT_MODEL),
            voice: var_or("VOICE", relay_core::generic_types::DEFAULT_VOICE),
            system_instructions_path: PathBuf::from(var_or(
                "SYSTEM_INSTRUCTIONS_PATH",
                "config/system-instructions.txt",
            )),
            audio_output_dir: PathBuf::from(var_or("AUDIO_OUTPUT_DIR", "output_audio")),
            setup_timeout: seconds_var("SETUP_TIMEOUT_SECS", 30)?,
            idle_timeout: seconds_var("IDLE_TIMEOUT_SECS", 600)?,
            function_urls: FunctionUrls {
                weather: optional_var("WEATHER_FUNCTION_URL"),
                forecast: optional_var("FORECAST_FUNCTION_URL"),
                calendar: optional_var("CALENDAR_FUNCTION_URL"),
                past_appointments: optional_var("PAST_APPOINTMENTS_FUNCTION_URL"),
            },
        })
    }

    /// Warns about settings that leave features unavailable. Call once logging
    /// is initialised.
    pub fn log_summary(&self) {
        if self.google_api_key.is_none() {
            warn!("GOOGLE_API_KEY is not set. Live sessions will fail to start.");
        }
        for (var, tool, url) in self.function_urls.entries() {
            match url {
                None => warn!(%var, %tool, "Cloud function URL not configured."),
                Some(url) if !url.starts_with("https://") => {
                    warn!(%var, %tool, "Cloud function URL does not use https://.")
                }
                Some(_) => info!(%tool, "Cloud function configured."),
            }
        }
    }

    /// Reads the system instruction. An unreadable file yields no instruction.
    pub fn load_system_instructions(&self) -> Option<String> {
        read_instructions(&self.system_instructions_path)
    }
}

fn read_instructions(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => Some(text),
        Ok(_) => {
            warn!(path = %path.display(), "System instructions file is empty.");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read system instructions.");
            None
        }
    }
}
