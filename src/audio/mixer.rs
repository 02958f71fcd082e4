//! Codec register access through the mixer control interface.
//!
//! Controls are addressed by their zero-based position in the card's control
//! list, the same numbering `tinymix` prints. ALSA element numids start at 1.

use std::sync::Arc;
use std::time::Duration;

use alsa::ctl::ElemType;
use alsa::hctl::{Elem, HCtl};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use super::card_locator::{AlsaCardProbe, CardProbe, CommandCardProbe, FallbackCardProbe};
use super::command::run_command;
use crate::config::{MixerBackend, MixerConfig};
use crate::error::MixerError;

#[async_trait]
pub trait MixerControl: Send + Sync {
    fn name(&self) -> &str;

    /// Write `value` to every channel of control `control` on `card`.
    async fn set_control(&self, card: u32, control: u32, value: i64) -> Result<(), MixerError>;

    /// Read the first channel of a control.
    async fn get_control(&self, card: u32, control: u32) -> Result<i64, MixerError>;
}

/// Native mixer access via the ALSA control API.
#[derive(Debug, Default)]
pub struct AlsaMixer;

/// Run `f` on control `control` of `card`. HCtl only looks elements up by
/// name, so the element is found by walking the list for its numid.
fn with_elem<T>(card: u32, control: u32, f: impl FnOnce(&Elem) -> Result<T>) -> Result<T> {
    let hctl = HCtl::new(&format!("hw:{}", card), false)
        .with_context(|| format!("Failed to open control interface of card {}", card))?;
    hctl.load()
        .with_context(|| format!("Failed to load controls of card {}", card))?;

    let numid = control + 1;
    for elem in hctl.elem_iter() {
        if elem.get_id()?.get_numid() == numid {
            return f(&elem);
        }
    }
    bail!("No control {} on card {}", control, card)
}

fn write_elem(card: u32, control: u32, value: i64) -> Result<()> {
    with_elem(card, control, |elem| {
        let info = elem.info()?;
        let elem_type = info.get_type();
        let mut current = elem
            .read()
            .with_context(|| format!("Failed to read control {} on card {}", control, card))?;

        for idx in 0..info.get_count() {
            let applied = match elem_type {
                ElemType::Integer => {
                    let v = i32::try_from(value).context("value out of range for integer control")?;
                    current.set_integer(idx, v)
                }
                ElemType::Integer64 => current.set_integer64(idx, value),
                ElemType::Enumerated => {
                    let v = u32::try_from(value).context("negative value for enumerated control")?;
                    current.set_enumerated(idx, v)
                }
                ElemType::Boolean => current.set_boolean(idx, value != 0),
                _ => bail!("control {} has an unsupported element type", control),
            };
            if applied.is_none() {
                bail!("failed to set channel {} of control {}", idx, control);
            }
        }

        elem.write(&current)
            .with_context(|| format!("Failed to write control {} on card {}", control, card))?;
        Ok(())
    })
}

fn read_elem(card: u32, control: u32) -> Result<i64> {
    with_elem(card, control, |elem| {
        let elem_type = elem.info()?.get_type();
        let current = elem
            .read()
            .with_context(|| format!("Failed to read control {} on card {}", control, card))?;

        let value = match elem_type {
            ElemType::Integer => current.get_integer(0).map(i64::from),
            ElemType::Integer64 => current.get_integer64(0),
            ElemType::Enumerated => current.get_enumerated(0).map(i64::from),
            ElemType::Boolean => current.get_boolean(0).map(i64::from),
            _ => bail!("control {} has an unsupported element type", control),
        };
        value.with_context(|| format!("control {} has no value", control))
    })
}

#[async_trait]
impl MixerControl for AlsaMixer {
    fn name(&self) -> &str {
        "alsa"
    }

    async fn set_control(&self, card: u32, control: u32, value: i64) -> Result<(), MixerError> {
        tokio::task::spawn_blocking(move || write_elem(card, control, value))
            .await
            .map_err(|e| MixerError::Backend(e.to_string()))?
            .map_err(|e| MixerError::Backend(format!("{:#}", e)))
    }

    async fn get_control(&self, card: u32, control: u32) -> Result<i64, MixerError> {
        tokio::task::spawn_blocking(move || read_elem(card, control))
            .await
            .map_err(|e| MixerError::Backend(e.to_string()))?
            .map_err(|e| MixerError::Backend(format!("{:#}", e)))
    }
}

/// Drives the codec through a command-line mixer tool (`tinymix -D <card> <control> <value>`).
pub struct CommandMixer {
    program: String,
    timeout: Duration,
}

impl CommandMixer {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl MixerControl for CommandMixer {
    fn name(&self) -> &str {
        &self.program
    }

    async fn set_control(&self, card: u32, control: u32, value: i64) -> Result<(), MixerError> {
        let args = [
            "-D".to_string(),
            card.to_string(),
            control.to_string(),
            value.to_string(),
        ];
        run_command(&self.program, &args, self.timeout).await.map(|_| ())
    }

    async fn get_control(&self, card: u32, control: u32) -> Result<i64, MixerError> {
        let args = ["-D".to_string(), card.to_string(), control.to_string()];
        let output = run_command(&self.program, &args, self.timeout).await?;
        parse_control_value(&output)
            .ok_or_else(|| MixerError::Unsupported(format!("cannot parse '{}'", output.trim())))
    }
}

/// First integer after the colon of a line like `ALC Capture Max PGA: 4`.
/// Enumerated controls print names instead and yield `None`.
fn parse_control_value(output: &str) -> Option<i64> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let values = line.rsplit_once(':').map_or(line, |(_, v)| v);
    values
        .split_whitespace()
        .next()
        .and_then(|v| v.trim_start_matches('>').parse().ok())
}

/// Tries `primary` and uses `fallback` when it fails.
pub struct FallbackMixer {
    primary: Arc<dyn MixerControl>,
    fallback: Arc<dyn MixerControl>,
}

impl FallbackMixer {
    pub fn new(primary: Arc<dyn MixerControl>, fallback: Arc<dyn MixerControl>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl MixerControl for FallbackMixer {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn set_control(&self, card: u32, control: u32, value: i64) -> Result<(), MixerError> {
        match self.primary.set_control(card, control, value).await {
            Ok(()) => Ok(()),
            Err(e) => {
                log::debug!("{} failed on control {}: {}", self.primary.name(), control, e);
                self.fallback.set_control(card, control, value).await
            }
        }
    }

    async fn get_control(&self, card: u32, control: u32) -> Result<i64, MixerError> {
        match self.primary.get_control(card, control).await {
            Ok(v) => Ok(v),
            Err(e) => {
                log::debug!("{} failed on control {}: {}", self.primary.name(), control, e);
                self.fallback.get_control(card, control).await
            }
        }
    }
}

/// Mixer for the configured backend.
pub fn build_mixer(config: &MixerConfig) -> Arc<dyn MixerControl> {
    let command = || Arc::new(CommandMixer::new(&config.control_command, config.step_timeout));
    match config.backend {
        MixerBackend::Alsa => Arc::new(AlsaMixer),
        MixerBackend::Command => command(),
        MixerBackend::Auto => Arc::new(FallbackMixer::new(Arc::new(AlsaMixer), command())),
    }
}

/// Card listing source for the configured backend.
pub fn build_card_probe(config: &MixerConfig) -> Arc<dyn CardProbe> {
    let command = || Arc::new(CommandCardProbe::new(&config.list_command, config.step_timeout));
    match config.backend {
        MixerBackend::Alsa => Arc::new(AlsaCardProbe),
        MixerBackend::Command => command(),
        MixerBackend::Auto => Arc::new(FallbackCardProbe::new(Arc::new(AlsaCardProbe), command())),
    }
}
