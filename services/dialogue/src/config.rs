use iflytek_tts::VoiceParameters;
use secrecy::SecretString;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    pub api_base_url: String,
    pub auth_token: SecretString,
    pub openai_api_key: SecretString,
    pub openai_base_url: String,
    pub chat_model: String,
    pub iflytek_app_id: String,
    pub voice: VoiceParameters,
    pub audio_output_dir: PathBuf,
    pub negotiation_timeout: Duration,
    pub log_level: Level,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Reads a variable that has no default. Unfilled template placeholders
/// count as invalid.
fn required(name: &str) -> Result<String, ConfigError> {
    let value = std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingVar(name.to_string()))?;
    if value.starts_with("YOUR_") && value.ends_with("_HERE") {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "still holds the .env template placeholder".to_string(),
        ));
    }
    Ok(value)
}

fn level(name: &str, default: u32) -> Result<u32, ConfigError> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(default);
    };
    match raw.trim().parse::<u32>() {
        Ok(value) if value <= 100 => Ok(value),
        _ => Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("'{raw}' is not an integer between 0 and 100"),
        )),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let api_base_url = var_or("API_BASE_URL", "http://localhost:3000/api");
        let auth_token = SecretString::from(required("AUTH_TOKEN")?);
        let openai_api_key = SecretString::from(required("OPENAI_API_KEY")?);
        let openai_base_url = var_or("OPENAI_BASE_URL", "https://api.openai.com/v1");
        let chat_model = var_or("CHAT_MODEL", "gpt-4o-mini");
        let iflytek_app_id = required("IFLYTEK_APP_ID")?;

        let defaults = VoiceParameters::default();
        let voice = VoiceParameters {
            voice: var_or("TTS_VOICE", &defaults.voice),
            speed: level("TTS_SPEED", defaults.speed)?,
            volume: level("TTS_VOLUME", defaults.volume)?,
            pitch: level("TTS_PITCH", defaults.pitch)?,
            ..defaults
        };

        let audio_output_dir = PathBuf::from(var_or("AUDIO_OUTPUT_DIR", "wavecraft/audio_logs"));

        let timeout_str = var_or("NEGOTIATION_TIMEOUT_SECS", "15");
        let negotiation_timeout = timeout_str
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .ok_or_else(|| {
                ConfigError::InvalidValue(
                    "NEGOTIATION_TIMEOUT_SECS".to_string(),
                    format!("'{timeout_str}' is not a positive number of seconds"),
                )
            })?;

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            api_base_url,
            auth_token,
            openai_api_key,
            openai_base_url,
            chat_model,
            iflytek_app_id,
            voice,
            audio_output_dir,
            negotiation_timeout,
            log_level,
        })
    }

    /// Skeleton `.env` listing every variable `from_env` reads.
    pub fn env_template() -> &'static str {
        concat!(
            "API_BASE_URL=\"http://localhost:3000/api\"\n",
            "AUTH_TOKEN=\"YOUR_API_KEY_HERE\"\n",
            "OPENAI_API_KEY=\"YOUR_OPENAI_KEY_HERE\"\n",
            "IFLYTEK_APP_ID=\"YOUR_IFLYTEK_APPID_HERE\"\n",
            "# OPENAI_BASE_URL=\"https://api.openai.com/v1\"\n",
            "# CHAT_MODEL=\"gpt-4o-mini\"\n",
            "# TTS_VOICE=\"x5_lingfeiyi_flow\"\n",
            "# TTS_SPEED=50\n",
            "# TTS_VOLUME=50\n",
            "# TTS_PITCH=50\n",
            "# AUDIO_OUTPUT_DIR=\"wavecraft/audio_logs\"\n",
            "# NEGOTIATION_TIMEOUT_SECS=15\n",
            "# RUST_LOG=INFO\n",
        )
    }
}
