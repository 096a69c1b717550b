//! Process configuration.
//!
//! Sources, lowest precedence first: a TOML file, `RECOGNIZER_*` environment
//! variables, then command-line overrides. The result is validated once and
//! is immutable afterwards; any malformed value fails startup.

use recognizer_core::pipeline::{Mode, PipelineSettings};
use recognizer_core::{LabelPolicy, NotificationMessages, PolicyError, ThresholdMap};
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_FILE_ENV: &str = "RECOGNIZER_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
const DEFAULT_CONFIG_DIRS: [&str; 2] = [".", "./configs"];

const RUN_MODE_ENV: &str = "RECOGNIZER_RUN_MODE";
const DISCOVERY_MODE_ENV: &str = "RECOGNIZER_DISCOVERY_MODE";
const DISCOVERY_LABELS_FILE_ENV: &str = "RECOGNIZER_DISCOVERY_LABELS_FILE";
const TARGET_IMAGE_PATH_ENV: &str = "RECOGNIZER_TARGET_IMAGE_PATH";
const TARGET_IMAGE_POLL_MS_ENV: &str = "RECOGNIZER_TARGET_IMAGE_POLL_MS";
const SAMPLE_IMAGE_PATHS_ENV: &str = "RECOGNIZER_SAMPLE_IMAGE_PATHS";
const SIMILARITY_THRESHOLD_ENV: &str = "RECOGNIZER_SIMILARITY_THRESHOLD";
const CONFIDENCES_NOT_LESS_THAN_ENV: &str = "RECOGNIZER_CONFIDENCES_NOT_LESS_THAN";
const CONFIDENCES_NOT_MORE_THAN_ENV: &str = "RECOGNIZER_CONFIDENCES_NOT_MORE_THAN";
const CALL_TIMEOUT_SECS_ENV: &str = "RECOGNIZER_CALL_TIMEOUT_SECS";
const API_LISTEN_ENV: &str = "RECOGNIZER_API_LISTEN";
const API_GRAB_TIMEOUT_SECS_ENV: &str = "RECOGNIZER_API_GRAB_TIMEOUT_SECS";
const API_FFMPEG_ENV: &str = "RECOGNIZER_API_FFMPEG";
const MQTT_BROKER_ENV: &str = "RECOGNIZER_MQTT_BROKER";
const MQTT_PORT_ENV: &str = "RECOGNIZER_MQTT_PORT";
const MQTT_CLIENT_ID_ENV: &str = "RECOGNIZER_MQTT_CLIENT_ID";
const MQTT_USERNAME_ENV: &str = "RECOGNIZER_MQTT_USERNAME";
const MQTT_PASSWORD_ENV: &str = "RECOGNIZER_MQTT_PASSWORD";
const MQTT_TOPIC_ENV: &str = "RECOGNIZER_MQTT_TOPIC";
const MQTT_RECOGNIZED_MESSAGE_ENV: &str = "RECOGNIZER_MQTT_RECOGNIZED_MESSAGE";
const MQTT_NOT_RECOGNIZED_MESSAGE_ENV: &str = "RECOGNIZER_MQTT_NOT_RECOGNIZED_MESSAGE";
const AWS_REGION_ENV: &str = "RECOGNIZER_AWS_REGION";

const DEFAULT_SIMILARITY_THRESHOLD: f32 = 95.0;
const DEFAULT_POLL_MS: u64 = 500;
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 10;
const DEFAULT_GRAB_TIMEOUT_SECS: u64 = 10;
const DEFAULT_LISTEN: &str = "0.0.0.0:8082";
const DEFAULT_FFMPEG: &str = "ffmpeg";
const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_MQTT_TOPIC: &str = "entrance/recognizer";
const DEFAULT_RECOGNIZED_MESSAGE: &str = r#"{"message": "recognized"}"#;
const DEFAULT_NOT_RECOGNIZED_MESSAGE: &str = r#"{"message": "not_recognized"}"#;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("label policy {key}: {source}")]
    Policy {
        key: &'static str,
        #[source]
        source: PolicyError,
    },
    #[error("reading reference image {}: {source}", path.display())]
    ReferenceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reference image {}: {source}", path.display())]
    ReferenceFormat {
        path: PathBuf,
        #[source]
        source: crate::format::FormatError,
    },
}

/// How images reach the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Poll a path on disk for dropped snapshots.
    #[default]
    FileWatcher,
    /// Serve `POST /v1/recognize`.
    Api,
}

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "file_watcher" | "file-watcher" => Ok(Self::FileWatcher),
            "api" => Ok(Self::Api),
            other => Err(ConfigError::InvalidValue {
                key: "run_mode",
                value: other.to_string(),
                reason: "expected file_watcher or api".into(),
            }),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileWatcher => write!(f, "file_watcher"),
            Self::Api => write!(f, "api"),
        }
    }
}

/// One reference image to load at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSource {
    pub path: PathBuf,
    pub threshold: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiConfig {
    pub listen: SocketAddr,
    pub grab_timeout: Duration,
    pub ffmpeg: PathBuf,
}

/// Broker connection settings.
#[derive(Clone, PartialEq)]
pub struct MqttConnection {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for MqttConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttConnection")
            .field("broker", &self.broker)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Validated, immutable configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub run_mode: RunMode,
    pub discovery_mode: bool,
    pub discovery_labels_file: Option<PathBuf>,
    /// Required in file-watcher mode.
    pub target_image_path: Option<PathBuf>,
    pub target_image_poll: Duration,
    pub references: Vec<ReferenceSource>,
    pub label_policy: LabelPolicy,
    pub call_timeout: Duration,
    pub api: ApiConfig,
    pub notifications: NotificationMessages,
    /// Absent only in discovery mode, where nothing is published.
    pub mqtt: Option<MqttConnection>,
    pub aws_region: Option<String>,
}

/// Overrides supplied on the command line.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub path: Option<PathBuf>,
    pub run_mode: Option<RunMode>,
    pub discovery: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    run_mode: Option<String>,
    discovery_mode: Option<bool>,
    discovery_labels_file: Option<PathBuf>,
    target_image_path: Option<PathBuf>,
    target_image_poll_ms: Option<u64>,
    sample_image_paths: Vec<PathBuf>,
    references: Vec<FileReference>,
    similarity_threshold: Option<f32>,
    confidences_not_less_than: Option<String>,
    confidences_not_more_than: Option<String>,
    call_timeout_secs: Option<u64>,
    api: FileApi,
    mqtt: FileMqtt,
    aws: FileAws,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileReference {
    path: PathBuf,
    threshold: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileApi {
    listen: Option<String>,
    grab_timeout_secs: Option<u64>,
    ffmpeg: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileMqtt {
    broker: Option<String>,
    port: Option<u16>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    topic: Option<String>,
    recognized_message: Option<String>,
    not_recognized_message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileAws {
    region: Option<String>,
}

impl Config {
    /// Load from the config file, the process environment, and `options`.
    pub fn load(options: &LoadOptions) -> Result<Self, ConfigError> {
        Self::load_with(options, |key| std::env::var(key).ok())
    }

    /// Load with an explicit environment lookup.
    pub fn load_with<E>(options: &LoadOptions, env: E) -> Result<Self, ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let explicit = options
            .path
            .clone()
            .or_else(|| env(CONFIG_FILE_ENV).map(PathBuf::from));

        let file = match explicit {
            Some(path) => read_file(&path)?,
            None => match find_default_file() {
                Some(path) => {
                    tracing::info!(path = %path.display(), "found config file");
                    read_file(&path)?
                }
                None => FileConfig::default(),
            },
        };

        Self::resolve(file, options, &env)
    }

    /// Parse a TOML document with no environment or command-line input.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file = parse_file(text, Path::new("<inline>"))?;
        Self::resolve(file, &LoadOptions::default(), &|_: &str| None)
    }

    fn resolve<E>(file: FileConfig, options: &LoadOptions, env: &E) -> Result<Self, ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let run_mode = match options.run_mode {
            Some(mode) => mode,
            None => match env(RUN_MODE_ENV).or(file.run_mode) {
                Some(value) => value.parse()?,
                None => RunMode::default(),
            },
        };

        let discovery_mode = match options.discovery {
            Some(flag) => flag,
            None => env_parse_bool(env, DISCOVERY_MODE_ENV)?
                .or(file.discovery_mode)
                .unwrap_or(false),
        };

        let discovery_labels_file = env(DISCOVERY_LABELS_FILE_ENV)
            .map(PathBuf::from)
            .or(file.discovery_labels_file);

        let target_image_path = env(TARGET_IMAGE_PATH_ENV)
            .map(PathBuf::from)
            .or(file.target_image_path);
        if run_mode == RunMode::FileWatcher && target_image_path.is_none() {
            return Err(ConfigError::Missing("target_image_path"));
        }

        let target_image_poll = Duration::from_millis(
            env_parse(env, TARGET_IMAGE_POLL_MS_ENV)?
                .or(file.target_image_poll_ms)
                .unwrap_or(DEFAULT_POLL_MS),
        );

        let similarity_threshold = env_parse(env, SIMILARITY_THRESHOLD_ENV)?
            .or(file.similarity_threshold)
            .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD);
        check_threshold("similarity_threshold", similarity_threshold)?;

        let sample_paths = match env(SAMPLE_IMAGE_PATHS_ENV) {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect(),
            None => file.sample_image_paths,
        };

        let mut references: Vec<ReferenceSource> = sample_paths
            .into_iter()
            .map(|path| ReferenceSource {
                path,
                threshold: similarity_threshold,
            })
            .collect();
        for entry in file.references {
            let threshold = entry.threshold.unwrap_or(similarity_threshold);
            check_threshold("references.threshold", threshold)?;
            references.push(ReferenceSource {
                path: entry.path,
                threshold,
            });
        }
        if references.is_empty() {
            return Err(ConfigError::Missing("sample_image_paths"));
        }

        let not_less_than = env(CONFIDENCES_NOT_LESS_THAN_ENV)
            .or(file.confidences_not_less_than)
            .unwrap_or_default();
        let not_more_than = env(CONFIDENCES_NOT_MORE_THAN_ENV)
            .or(file.confidences_not_more_than)
            .unwrap_or_default();
        let label_policy = LabelPolicy::new(
            ThresholdMap::parse(&not_less_than).map_err(|source| {
                ConfigError::Policy {
                    key: "confidences_not_less_than",
                    source,
                }
            })?,
            ThresholdMap::parse(&not_more_than).map_err(|source| {
                ConfigError::Policy {
                    key: "confidences_not_more_than",
                    source,
                }
            })?,
        );

        let call_timeout = Duration::from_secs(
            env_parse(env, CALL_TIMEOUT_SECS_ENV)?
                .or(file.call_timeout_secs)
                .unwrap_or(DEFAULT_CALL_TIMEOUT_SECS),
        );
        if call_timeout.is_zero() {
            return Err(invalid("call_timeout_secs", "0", "must be positive"));
        }

        let listen = env(API_LISTEN_ENV)
            .or(file.api.listen)
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let api = ApiConfig {
            listen: listen
                .parse()
                .map_err(|e: std::net::AddrParseError| invalid("api.listen", &listen, e))?,
            grab_timeout: Duration::from_secs(
                env_parse(env, API_GRAB_TIMEOUT_SECS_ENV)?
                    .or(file.api.grab_timeout_secs)
                    .unwrap_or(DEFAULT_GRAB_TIMEOUT_SECS),
            ),
            ffmpeg: env(API_FFMPEG_ENV)
                .map(PathBuf::from)
                .or(file.api.ffmpeg)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG)),
        };
        if api.grab_timeout.is_zero() {
            return Err(invalid("api.grab_timeout_secs", "0", "must be positive"));
        }

        let mqtt_file = file.mqtt;
        let notifications = NotificationMessages {
            topic: env(MQTT_TOPIC_ENV)
                .or(mqtt_file.topic)
                .unwrap_or_else(|| DEFAULT_MQTT_TOPIC.to_string()),
            recognized: env(MQTT_RECOGNIZED_MESSAGE_ENV)
                .or(mqtt_file.recognized_message)
                .unwrap_or_else(|| DEFAULT_RECOGNIZED_MESSAGE.to_string()),
            not_recognized: env(MQTT_NOT_RECOGNIZED_MESSAGE_ENV)
                .or(mqtt_file.not_recognized_message)
                .unwrap_or_else(|| DEFAULT_NOT_RECOGNIZED_MESSAGE.to_string()),
        };

        let broker = env(MQTT_BROKER_ENV).or(mqtt_file.broker);
        let mqtt = if broker.is_none() && discovery_mode {
            None
        } else {
            Some(MqttConnection {
                broker: broker.ok_or(ConfigError::Missing("mqtt.broker"))?,
                port: env_parse(env, MQTT_PORT_ENV)?
                    .or(mqtt_file.port)
                    .unwrap_or(DEFAULT_MQTT_PORT),
                client_id: env(MQTT_CLIENT_ID_ENV)
                    .or(mqtt_file.client_id)
                    .ok_or(ConfigError::Missing("mqtt.client_id"))?,
                username: env(MQTT_USERNAME_ENV)
                    .or(mqtt_file.username)
                    .ok_or(ConfigError::Missing("mqtt.username"))?,
                password: env(MQTT_PASSWORD_ENV)
                    .or(mqtt_file.password)
                    .ok_or(ConfigError::Missing("mqtt.password"))?,
            })
        };

        let aws_region = env(AWS_REGION_ENV).or(file.aws.region);

        Ok(Self {
            run_mode,
            discovery_mode,
            discovery_labels_file,
            target_image_path,
            target_image_poll,
            references,
            label_policy,
            call_timeout,
            api,
            notifications,
            mqtt,
            aws_region,
        })
    }

    pub fn mode(&self) -> Mode {
        if self.discovery_mode {
            Mode::Discovery
        } else {
            Mode::Normal
        }
    }

    /// Where discovery records go. Only set in discovery mode.
    pub fn diagnostics_file(&self) -> Option<&Path> {
        self.discovery_labels_file
            .as_deref()
            .filter(|_| self.discovery_mode)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            mode: self.mode(),
            messages: self.notifications.clone(),
            call_timeout: self.call_timeout,
        }
    }

    /// Loggable view of the configuration, without credentials.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "run_mode": self.run_mode.to_string(),
            "discovery_mode": self.discovery_mode,
            "discovery_labels_file": self.discovery_labels_file.as_ref().map(|p| p.display().to_string()),
            "target_image_path": self.target_image_path.as_ref().map(|p| p.display().to_string()),
            "target_image_poll_ms": self.target_image_poll.as_millis() as u64,
            "references": self.references.iter().map(|r| serde_json::json!({
                "path": r.path.display().to_string(),
                "threshold": r.threshold,
            })).collect::<Vec<_>>(),
            "confidences_not_less_than": self.label_policy.min_confidence.iter().collect::<Vec<_>>(),
            "confidences_not_more_than": self.label_policy.max_confidence.iter().collect::<Vec<_>>(),
            "call_timeout_secs": self.call_timeout.as_secs(),
            "api": {
                "listen": self.api.listen.to_string(),
                "grab_timeout_secs": self.api.grab_timeout.as_secs(),
                "ffmpeg": self.api.ffmpeg.display().to_string(),
            },
            "mqtt": self.mqtt.as_ref().map(|m| serde_json::json!({
                "broker": m.broker,
                "port": m.port,
                "client_id": m.client_id,
                "username": m.username,
                "topic": self.notifications.topic,
            })),
            "aws_region": self.aws_region,
        })
    }
}

fn find_default_file() -> Option<PathBuf> {
    DEFAULT_CONFIG_DIRS
        .iter()
        .map(|dir| Path::new(dir).join(DEFAULT_CONFIG_FILE))
        .find(|path| path.is_file())
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_file(&text, path)
}

fn parse_file(text: &str, path: &Path) -> Result<FileConfig, ConfigError> {
    toml::from_str(text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn invalid(key: &'static str, value: &str, reason: impl fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn check_threshold(key: &'static str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(key, &value.to_string(), "must be within [0, 100]"))
    }
}

fn env_parse<T, E>(env: &E, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    E: Fn(&str) -> Option<String>,
{
    env(key)
        .map(|raw| raw.trim().parse().map_err(|e| invalid(key, &raw, e)))
        .transpose()
}

fn env_parse_bool<E>(env: &E, key: &'static str) -> Result<Option<bool>, ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    env(key)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(invalid(key, &raw, "expected a boolean")),
        })
        .transpose()
}
