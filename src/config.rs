use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::CalibrationStep;
use crate::error::ConfigError;

/// 音频流相关配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    /// Preferred capture device (e.g. "plughw:3,0"); `None` means system default
    pub input_device: Option<String>,
    /// Preferred playback device; `None` means system default
    pub output_device: Option<String>,
    /// Length of one capture chunk handed to listeners, in ms
    pub frame_duration_ms: u32,
    /// When no device is configured, try the calibrated card before the default
    pub prefer_detected_card: bool,
    /// Frames written to the output per chunk; cancellation is checked between chunks
    pub playback_chunk_frames: usize,
    /// Queue depth at which a lagging listener gets a warning
    pub listener_backlog_warn: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            frame_duration_ms: 20,
            prefer_detected_card: false,
            playback_chunk_frames: 1024,
            listener_backlog_warn: 50,
        }
    }
}

/// Which mixer/card interface to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MixerBackend {
    /// ALSA control interface first, command-line tool as fallback
    Auto,
    Alsa,
    Command,
}

impl MixerBackend {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(Self::Auto),
            "alsa" => Some(Self::Alsa),
            "command" => Some(Self::Command),
            _ => None,
        }
    }
}

/// 混音器校准配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MixerConfig {
    pub backend: MixerBackend,
    /// Substring identifying the codec chip in the card listing (e.g. "es8388")
    pub card_identifier: String,
    /// Card index used when no card matches
    pub default_card: u32,
    pub control_command: String,
    pub list_command: String,
    pub step_timeout: Duration,
    pub steps: Vec<CalibrationStep>,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            backend: MixerBackend::Auto,
            card_identifier: String::new(),
            default_card: 0,
            control_command: "tinymix".to_string(),
            list_command: "aplay".to_string(),
            step_timeout: Duration::from_secs(1),
            steps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,
    pub board_type: &'static str,
    pub board_name: &'static str,
    pub audio: AudioConfig,
    pub mixer: MixerConfig,
    pub sensor_data_file: PathBuf,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),
            board_type: env!("BOARD_TYPE"),
            board_name: env!("BOARD_NAME"),

            audio: AudioConfig {
                input_device: non_empty(env!("AUDIO_INPUT_DEVICE")),
                output_device: non_empty(env!("AUDIO_OUTPUT_DEVICE")),
                frame_duration_ms: parse("AUDIO_FRAME_DURATION_MS", env!("AUDIO_FRAME_DURATION_MS"))?,
                prefer_detected_card: parse(
                    "AUDIO_PREFER_DETECTED_CARD",
                    env!("AUDIO_PREFER_DETECTED_CARD"),
                )?,
                playback_chunk_frames: parse(
                    "AUDIO_PLAYBACK_CHUNK_FRAMES",
                    env!("AUDIO_PLAYBACK_CHUNK_FRAMES"),
                )?,
                listener_backlog_warn: parse(
                    "AUDIO_LISTENER_BACKLOG_WARN",
                    env!("AUDIO_LISTENER_BACKLOG_WARN"),
                )?,
            },

            mixer: MixerConfig {
                backend: MixerBackend::parse(env!("MIXER_BACKEND")).ok_or_else(|| ConfigError {
                    key: "MIXER_BACKEND",
                    value: env!("MIXER_BACKEND").to_string(),
                })?,
                card_identifier: env!("MIXER_CARD_IDENTIFIER").to_string(),
                default_card: parse("MIXER_DEFAULT_CARD", env!("MIXER_DEFAULT_CARD"))?,
                control_command: env!("MIXER_CONTROL_COMMAND").to_string(),
                list_command: env!("MIXER_LIST_COMMAND").to_string(),
                step_timeout: Duration::from_millis(parse(
                    "MIXER_STEP_TIMEOUT_MS",
                    env!("MIXER_STEP_TIMEOUT_MS"),
                )?),
                steps: parse_steps(env!("MIXER_STEPS"))?,
            },

            sensor_data_file: PathBuf::from(env!("SENSOR_DATA_FILE")),
        })
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError {
        key,
        value: value.to_string(),
    })
}

/// Decode the `control,value,label|...` form produced by build.rs.
fn parse_steps(encoded: &str) -> Result<Vec<CalibrationStep>, ConfigError> {
    let mut steps = Vec::new();
    for entry in encoded.split('|').filter(|e| !e.trim().is_empty()) {
        let mut parts = entry.splitn(3, ',');
        let (Some(control), Some(value)) = (parts.next(), parts.next()) else {
            return Err(ConfigError {
                key: "MIXER_STEPS",
                value: entry.to_string(),
            });
        };
        let label = parts.next().unwrap_or_default().trim();
        steps.push(CalibrationStep::new(
            parse("MIXER_STEPS", control)?,
            parse("MIXER_STEPS", value)?,
            label,
        ));
    }
    Ok(steps)
}
