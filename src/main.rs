use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;

use xiaozhi_audio::audio::{tone, wav, AlsaHost, AudioHost, FrameForwarder};
use xiaozhi_audio::display::{Display, ServiceDisplay};
use xiaozhi_audio::{sensor, AudioCodec, Config, Direction};

const TESTS: [(&str, &str); 4] = [
    ("mic", "record until Enter and write mic_test_output.wav"),
    ("speaker", "play three 1 kHz beeps on the output device"),
    ("devices", "list capture and playback devices"),
    ("sensor", "print the temperature/humidity reading"),
];

const MIC_OUTPUT: &str = "mic_test_output.wav";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    let config = Config::new()?;
    log::info!(
        "{} {} on {} ({})",
        config.app_name,
        config.app_version,
        config.board_name,
        config.board_type
    );

    let display = ServiceDisplay::new();
    display.start().await;

    let test = std::env::args().nth(1).unwrap_or_default();
    match test.as_str() {
        "mic" => mic_test(&config, &display).await,
        "speaker" => speaker_test(&config, &display).await,
        "devices" => devices_test(),
        "sensor" => {
            println!("{}", sensor::temperature_humidity_json(&config.sensor_data_file).await);
            Ok(())
        }
        other => {
            if !other.is_empty() {
                println!("Unknown test: {}", other);
            }
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("Usage: xiaozhi-audio <test>");
    println!("Available tests:");
    for (name, about) in TESTS {
        println!("  {:<8} {}", name, about);
    }
}

async fn mic_test(config: &Config, display: &ServiceDisplay) -> anyhow::Result<()> {
    let codec = AudioCodec::new(config);

    // 10 秒 20ms 帧的缓冲
    let (tx, mut rx) = mpsc::channel(500);
    let listener = codec.add_audio_listener(Arc::new(FrameForwarder::new("mic-test", tx)))?;
    let collector = tokio::spawn(async move {
        let mut frames = 0usize;
        let mut samples: Vec<i16> = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames += 1;
            samples.extend_from_slice(frame.samples());
        }
        (frames, samples)
    });

    codec.initialize().await.context("Failed to open audio streams")?;
    let rate = codec.input_sample_rate().unwrap_or_default();
    if let Some(input) = codec.input_device() {
        println!("Recording from {}", input);
    }
    display.update_status("Recording", true).await;
    println!("Speak into the microphone, press Enter to stop...");

    let mut line = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        _ = stdin.read_line(&mut line) => {}
        _ = signal::ctrl_c() => println!(),
    }

    codec.close().await;
    codec.remove_audio_listener(listener);
    display.update_status("Idle", true).await;

    let (frames, samples) = collector.await.context("Frame collector failed")?;
    let seconds = if rate > 0 { samples.len() as f64 / f64::from(rate) } else { 0.0 };
    println!("Captured {} frames, {:.2} s at {} Hz", frames, seconds, rate);

    if samples.is_empty() {
        println!("No audio captured, nothing written");
        return Ok(());
    }
    wav::write_mono_i16(MIC_OUTPUT, rate, &samples)?;
    println!("Wrote {}", MIC_OUTPUT);
    Ok(())
}

async fn speaker_test(config: &Config, display: &ServiceDisplay) -> anyhow::Result<()> {
    let codec = AudioCodec::new(config);
    codec.initialize().await.context("Failed to open audio streams")?;

    let Some(output) = codec.output_device() else {
        codec.close().await;
        anyhow::bail!("no output device after initialization");
    };
    println!("Playing on {}", output);
    display.update_status("Speaking", true).await;

    let beeps = tone::calibration_beeps(output.sample_rate);
    let result = codec.play(&beeps, output.sample_rate, None).await;

    codec.close().await;
    display.update_status("Idle", true).await;
    result?;
    println!("Did you hear three beeps?");
    Ok(())
}

fn devices_test() -> anyhow::Result<()> {
    let host = AlsaHost::new();
    for direction in [Direction::Input, Direction::Output] {
        println!("{} devices:", direction);
        for device in host.devices(direction)? {
            println!("  {}", device);
        }
        match host.default_device(direction)? {
            Some(device) => println!("  default: {}", device),
            None => println!("  default: none"),
        }
    }
    Ok(())
}
