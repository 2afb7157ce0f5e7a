use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Well known variables that override the layered configuration, so a plain
/// `.env`-style deployment works without the `CS_` prefix.
const ENV_OVERRIDES: [(&str, &str); 4] = [
    ("OPENAI_API_KEY", "llm.api_key"),
    ("CAMERA_STREAM_URL_1", "cameras.primary.stream_url"),
    ("CAMERA_STREAM_URL_2", "cameras.secondary.stream_url"),
    ("ALERT_RECIPIENT", "notification.recipient"),
];

pub trait Validatable {
    fn validate(&self) -> Result<(), String>;
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub llm: LlmConfig,
    pub cameras: CamerasConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

impl Validatable for Config {
    fn validate(&self) -> Result<(), String> {
        self.llm.validate()?;
        self.cameras.validate()?;
        self.notification.validate()?;
        self.messaging.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default)]
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_image_detail")]
    pub image_detail: String,
}

// The api key must never reach the logs.
impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_turns", &self.max_turns)
            .field("image_detail", &self.image_detail)
            .finish()
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}

fn default_model() -> String {
    "gpt-4.1".into()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_max_turns() -> usize {
    10
}

fn default_image_detail() -> String {
    "auto".into()
}

impl LlmConfig {
    pub fn get_responses_url(&self) -> String {
        format!("{}/responses", self.base_url.trim_end_matches('/'))
    }
}

impl Validatable for LlmConfig {
    fn validate(&self) -> Result<(), String> {
        if self.api_key.trim().is_empty() {
            return Err("Missing language model api key (OPENAI_API_KEY)".into());
        }
        if self.max_turns == 0 {
            return Err("llm.max_turns must be at least 1".into());
        }
        match self.image_detail.as_str() {
            "auto" | "low" | "high" => Ok(()),
            other => Err(format!(
                "{} is not a supported image detail. Use `auto`, `low` or `high`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CamerasConfig {
    pub primary: CameraConfig,
    pub secondary: CameraConfig,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_jpeg_quality() -> u8 {
    90
}

impl CamerasConfig {
    pub fn all(&self) -> [&CameraConfig; 2] {
        [&self.primary, &self.secondary]
    }

    pub fn find_by_stream_url(&self, stream_url: &str) -> Option<&CameraConfig> {
        self.all()
            .into_iter()
            .find(|camera| camera.stream_url == stream_url)
    }
}

impl Validatable for CamerasConfig {
    fn validate(&self) -> Result<(), String> {
        self.primary.validate()?;
        self.secondary.validate()?;
        if self.primary.frame_path == self.secondary.frame_path {
            return Err("Both cameras write to the same frame path".into());
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(format!(
                "cameras.jpeg_quality must be between 1 and 100, got {}",
                self.jpeg_quality
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CameraConfig {
    pub name: String,
    #[serde(default)]
    pub stream_url: String,
    pub frame_path: PathBuf,
}

impl Validatable for CameraConfig {
    fn validate(&self) -> Result<(), String> {
        if self.stream_url.trim().is_empty() {
            return Err(format!("Missing stream url for camera `{}`", self.name));
        }
        if self.frame_path.as_os_str().is_empty() {
            return Err(format!("Missing frame path for camera `{}`", self.name));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct NotificationConfig {
    #[serde(default)]
    pub recipient: String,
}

impl Validatable for NotificationConfig {
    fn validate(&self) -> Result<(), String> {
        if self.recipient.trim().is_empty() {
            return Err("Missing notification recipient (ALERT_RECIPIENT)".into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MessagingConfig {
    pub server_name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

impl Validatable for MessagingConfig {
    fn validate(&self) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("Missing messaging server command".into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    600
}

impl Validatable for SchedulerConfig {
    fn validate(&self) -> Result<(), String> {
        if self.interval_secs == 0 {
            return Err("scheduler.interval_secs must be at least 1".into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

/// Frame paths end up in the agent instructions, where the messaging tool
/// needs them absolute.
fn resolve_frame_paths(config: &mut Config) -> std::io::Result<()> {
    for camera in [&mut config.cameras.primary, &mut config.cameras.secondary] {
        camera.frame_path = std::path::absolute(&camera.frame_path)?;
    }
    Ok(())
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir().map_err(|e| {
        config::ConfigError::Message(format!("Failed to determine the current directory: {}", e))
    })?;
    load_configuration(&base_path.join("configuration"))
}

pub fn load_configuration(configuration_directory: &Path) -> Result<Config, config::ConfigError> {
    load_configuration_with_env(configuration_directory, std::env::vars().collect())
}

/// Same as [`load_configuration`] with the environment variables passed in.
pub fn load_configuration_with_env(
    configuration_directory: &Path,
    env: config::Map<String, String>,
) -> Result<Config, config::ConfigError> {
    let environment: Environment = env
        .get("APP_ENVIRONMENT")
        .cloned()
        .unwrap_or_else(|| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let builder = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("CS")
                .prefix_separator("_")
                .separator("__")
                .source(Some(env.clone())),
        );

    let builder = ENV_OVERRIDES
        .iter()
        .try_fold(builder, |builder, (variable, key)| {
            let value = env.get(*variable).filter(|v| !v.trim().is_empty()).cloned();
            builder.set_override_option(*key, value)
        })?;

    let mut config: Config = builder.build()?.try_deserialize::<Config>()?;

    if let Err(e) = config.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    resolve_frame_paths(&mut config)
        .map_err(|e| config::ConfigError::Message(format!("Invalid frame path: {}", e)))?;

    Ok(config)
}
