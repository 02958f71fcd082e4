use std::sync::Arc;

use super::host::{AudioHost, DeviceDescriptor, Direction};
use crate::config::AudioConfig;
use crate::error::{AudioError, AudioResult};

/// The device pair a session runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDevices {
    pub input: DeviceDescriptor,
    pub output: DeviceDescriptor,
}

/// Picks the input and output device for a session.
///
/// Order per direction: configured device, then (if enabled) the card found
/// during calibration, then the platform default. A configured device that
/// cannot be found is a warning, not an error.
#[derive(Clone)]
pub struct DeviceResolver {
    host: Arc<dyn AudioHost>,
    input: Option<String>,
    output: Option<String>,
    prefer_detected_card: bool,
}

impl DeviceResolver {
    pub fn new(host: Arc<dyn AudioHost>, config: &AudioConfig) -> Self {
        Self {
            host,
            input: config.input_device.clone(),
            output: config.output_device.clone(),
            prefer_detected_card: config.prefer_detected_card,
        }
    }

    pub fn resolve(&self, detected_card: Option<u32>) -> AudioResult<ResolvedDevices> {
        let input = self.resolve_direction(Direction::Input, detected_card)?;
        let output = self.resolve_direction(Direction::Output, detected_card)?;
        log::info!("Resolved input device: {}", input);
        log::info!("Resolved output device: {}", output);
        Ok(ResolvedDevices { input, output })
    }

    pub fn resolve_direction(
        &self,
        direction: Direction,
        detected_card: Option<u32>,
    ) -> AudioResult<DeviceDescriptor> {
        let preference = match direction {
            Direction::Input => self.input.as_deref(),
            Direction::Output => self.output.as_deref(),
        };

        if let Some(id) = preference {
            match self.lookup(id, direction) {
                Ok(Some(device)) => return Ok(device),
                Ok(None) => log::warn!(
                    "Configured {} device '{}' not found, falling back to default",
                    direction,
                    id
                ),
                Err(e) => log::warn!(
                    "Configured {} device '{}' could not be queried ({}), falling back to default",
                    direction,
                    id,
                    e
                ),
            }
        }

        if let (true, Some(card)) = (self.prefer_detected_card, detected_card) {
            let id = format!("plughw:{},0", card);
            if let Ok(Some(device)) = self.lookup(&id, direction) {
                return Ok(device);
            }
            log::debug!("Detected card {} has no usable {} device", card, direction);
        }

        match self.host.default_device(direction) {
            Ok(Some(device)) => Ok(device),
            Ok(None) => Err(AudioError::DeviceUnavailable {
                direction,
                reason: "no configured device and no system default".to_string(),
            }),
            Err(e) => Err(AudioError::DeviceUnavailable {
                direction,
                reason: e.to_string(),
            }),
        }
    }

    /// Find `id` among the enumerated devices, probing it directly if it is
    /// not listed.
    pub fn lookup(&self, id: &str, direction: Direction) -> AudioResult<Option<DeviceDescriptor>> {
        match self.host.devices(direction) {
            Ok(devices) => {
                if let Some(device) = devices.into_iter().find(|d| d.id == id) {
                    return Ok(Some(device));
                }
            }
            Err(e) => log::warn!("Failed to enumerate {} devices: {}", direction, e),
        }
        self.host.probe(id, direction)
    }
}
