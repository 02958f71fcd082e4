use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    board: Board,
    audio: Audio,
    mixer: Mixer,
    sensor: Sensor,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Board {
    #[serde(rename = "type")]
    type_: String,
    name: String,
}

#[derive(Deserialize)]
struct Audio {
    input_device: String,
    output_device: String,
    frame_duration_ms: u32,
    prefer_detected_card: bool,
    playback_chunk_frames: usize,
    listener_backlog_warn: usize,
}

#[derive(Deserialize)]
struct Mixer {
    backend: String,
    card_identifier: String,
    default_card: u32,
    control_command: String,
    list_command: String,
    step_timeout_ms: u64,
    steps: Vec<Step>,
}

#[derive(Deserialize)]
struct Step {
    control: u32,
    value: i64,
    label: String,
}

#[derive(Deserialize)]
struct Sensor {
    data_file: String,
}

// 校准步骤压缩成一行环境变量: "control,value,label|control,value,label"
fn encode_steps(steps: &[Step]) -> String {
    steps
        .iter()
        .map(|s| {
            if s.label.contains('|') || s.label.contains(',') {
                panic!("mixer step label must not contain '|' or ',': {}", s.label);
            }
            format!("{},{},{}", s.control, s.value, s.label)
        })
        .collect::<Vec<_>>()
        .join("|")
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用和板子信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);
    println!("cargo:rustc-env=BOARD_TYPE={}", config.board.type_);
    println!("cargo:rustc-env=BOARD_NAME={}", config.board.name);

    // 音频配置
    println!("cargo:rustc-env=AUDIO_INPUT_DEVICE={}", config.audio.input_device);
    println!("cargo:rustc-env=AUDIO_OUTPUT_DEVICE={}", config.audio.output_device);
    println!("cargo:rustc-env=AUDIO_FRAME_DURATION_MS={}", config.audio.frame_duration_ms);
    println!("cargo:rustc-env=AUDIO_PREFER_DETECTED_CARD={}", config.audio.prefer_detected_card);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_CHUNK_FRAMES={}", config.audio.playback_chunk_frames);
    println!("cargo:rustc-env=AUDIO_LISTENER_BACKLOG_WARN={}", config.audio.listener_backlog_warn);

    // 混音器校准配置
    println!("cargo:rustc-env=MIXER_BACKEND={}", config.mixer.backend);
    println!("cargo:rustc-env=MIXER_CARD_IDENTIFIER={}", config.mixer.card_identifier);
    println!("cargo:rustc-env=MIXER_DEFAULT_CARD={}", config.mixer.default_card);
    println!("cargo:rustc-env=MIXER_CONTROL_COMMAND={}", config.mixer.control_command);
    println!("cargo:rustc-env=MIXER_LIST_COMMAND={}", config.mixer.list_command);
    println!("cargo:rustc-env=MIXER_STEP_TIMEOUT_MS={}", config.mixer.step_timeout_ms);
    println!("cargo:rustc-env=MIXER_STEPS={}", encode_steps(&config.mixer.steps));

    // 传感器数据文件
    println!("cargo:rustc-env=SENSOR_DATA_FILE={}", config.sensor.data_file);
}
