//! recognizer-io: everything the recognition pipeline touches outside the process.
//!
//! Configuration loading, reference loading, snapshot intake from a watched
//! file or an ffmpeg frame grab, the AWS Rekognition backend, the MQTT
//! notifier, and the on-disk discovery sink.

pub mod config;
pub mod format;
pub mod grabber;
pub mod mqtt;
pub mod references;
pub mod rekognition;
pub mod sink;
pub mod watcher;

pub use config::{Config, ConfigError, LoadOptions, RunMode};
pub use format::FormatError;
pub use grabber::{FfmpegGrabber, FrameSource, GrabError};
pub use mqtt::{MqttNotifier, NoopNotifier};
pub use references::load_references;
pub use rekognition::RekognitionBackend;
pub use sink::FileDiagnosticSink;
pub use watcher::{FileWatcher, WatchError};
