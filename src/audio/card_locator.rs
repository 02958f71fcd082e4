//! Locating the sound card that carries the codec chip.

use std::sync::Arc;
use std::time::Duration;

use alsa::ctl::{Ctl, DeviceIter};
use anyhow::{Context, Result};
use async_trait::async_trait;

use super::command::run_command;

/// One entry of the system's sound card listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoundCard {
    pub index: u32,
    pub description: String,
}

/// Source of the sound card listing.
#[async_trait]
pub trait CardProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn cards(&self) -> Result<Vec<SoundCard>>;
}

/// Reads the card list straight from the ALSA control interface.
///
/// Like `aplay -l`, only cards with at least one playback device are listed.
#[derive(Debug, Default)]
pub struct AlsaCardProbe;

fn has_playback_device(card: &alsa::Card) -> bool {
    let Ok(ctl) = Ctl::from_card(card, false) else {
        return false;
    };
    DeviceIter::new(&ctl).any(|device| {
        u32::try_from(device)
            .is_ok_and(|device| ctl.pcm_info(device, 0, alsa::Direction::Playback).is_ok())
    })
}

#[async_trait]
impl CardProbe for AlsaCardProbe {
    fn name(&self) -> &str {
        "alsa"
    }

    async fn cards(&self) -> Result<Vec<SoundCard>> {
        let mut cards = Vec::new();
        for card in alsa::card::Iter::new() {
            let card = card.context("Failed to iterate sound cards")?;
            let index = card.get_index();
            if !has_playback_device(&card) {
                log::debug!("Card {} has no playback device, skipping", index);
                continue;
            }
            let name = card.get_name().unwrap_or_default();
            let longname = card.get_longname().unwrap_or_default();
            cards.push(SoundCard {
                index: u32::try_from(index).context("negative card index")?,
                description: format!("{} [{}]", name, longname),
            });
        }
        Ok(cards)
    }
}

/// Parses the output of the listing tool (`aplay -l`).
pub struct CommandCardProbe {
    program: String,
    timeout: Duration,
}

impl CommandCardProbe {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl CardProbe for CommandCardProbe {
    fn name(&self) -> &str {
        &self.program
    }

    async fn cards(&self) -> Result<Vec<SoundCard>> {
        let output = run_command(&self.program, &["-l".to_string()], self.timeout)
            .await
            .with_context(|| format!("Failed to list cards with {}", self.program))?;
        Ok(parse_card_listing(&output))
    }
}

/// Asks `primary` first and falls back when it fails or lists nothing.
pub struct FallbackCardProbe {
    primary: Arc<dyn CardProbe>,
    fallback: Arc<dyn CardProbe>,
}

impl FallbackCardProbe {
    pub fn new(primary: Arc<dyn CardProbe>, fallback: Arc<dyn CardProbe>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl CardProbe for FallbackCardProbe {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn cards(&self) -> Result<Vec<SoundCard>> {
        match self.primary.cards().await {
            Ok(cards) if !cards.is_empty() => return Ok(cards),
            Ok(_) => log::debug!("{} listed no cards, trying {}", self.primary.name(), self.fallback.name()),
            Err(e) => log::debug!("{} failed: {:#}, trying {}", self.primary.name(), e, self.fallback.name()),
        }
        self.fallback.cards().await
    }
}

/// Extract cards from lines like
/// `card 3: rockchipes8388 [rockchip,es8388], device 0: ...`.
///
/// A card with several devices appears once.
pub fn parse_card_listing(text: &str) -> Vec<SoundCard> {
    let mut cards: Vec<SoundCard> = Vec::new();
    for line in text.lines() {
        let Some(rest) = line.trim_start().strip_prefix("card ") else {
            continue;
        };
        let Some((index, description)) = rest.split_once(':') else {
            continue;
        };
        let Ok(index) = index.trim().parse::<u32>() else {
            continue;
        };
        if cards.iter().any(|c| c.index == index) {
            continue;
        }
        cards.push(SoundCard {
            index,
            description: description.trim().to_string(),
        });
    }
    cards
}

/// Finds the codec's card index, never failing.
#[derive(Clone)]
pub struct CardLocator {
    probe: Arc<dyn CardProbe>,
    identifier: String,
    default_index: u32,
}

impl CardLocator {
    pub fn new(probe: Arc<dyn CardProbe>, identifier: impl Into<String>, default_index: u32) -> Self {
        Self {
            probe,
            identifier: identifier.into(),
            default_index,
        }
    }

    pub fn default_index(&self) -> u32 {
        self.default_index
    }

    /// Index of the first card whose description contains the identifier
    /// (case-insensitive). Falls back to the configured default when the
    /// listing fails or nothing matches.
    pub async fn locate(&self) -> u32 {
        let cards = match self.probe.cards().await {
            Ok(cards) => cards,
            Err(e) => {
                log::warn!(
                    "Card listing via {} failed: {:#}; using default card {}",
                    self.probe.name(),
                    e,
                    self.default_index
                );
                return self.default_index;
            }
        };

        match find_card(&cards, &self.identifier) {
            Some(index) => {
                log::info!("Found {} on card {}", self.identifier, index);
                index
            }
            None => {
                log::warn!(
                    "No card matching '{}' among {} cards; using default card {}",
                    self.identifier,
                    cards.len(),
                    self.default_index
                );
                self.default_index
            }
        }
    }
}

fn find_card(cards: &[SoundCard], identifier: &str) -> Option<u32> {
    if identifier.is_empty() {
        return None;
    }
    let needle = identifier.to_lowercase();
    cards
        .iter()
        .find(|c| c.description.to_lowercase().contains(&needle))
        .map(|c| c.index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mock::MockCardProbe;

    const APLAY_L: &str = "\
**** List of PLAYBACK Hardware Devices ****
card 0: rockchiphdmi [rockchip-hdmi], device 0: rockchip-hdmi i2s-hifi-0 []
  Subdevices: 1/1
  Subdevice #0: subdevice #0
card 3: rockchipes8388 [rockchip-es8388], device 0: dailink-multicodecs ES8323.7-0011-0 []
  Subdevices: 1/1
card 3: rockchipes8388 [rockchip-es8388], device 1: second []
";

    #[test]
    fn parses_aplay_listing() {
        let cards = parse_card_listing(APLAY_L);
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[0].index, 0);
        assert_eq!(cards[1].index, 3);
        assert!(cards[1].description.starts_with("rockchipes8388"));
    }

    #[test]
    fn ignores_noise() {
        assert!(parse_card_listing("aplay: device_list:274: no soundcards found...").is_empty());
        assert!(parse_card_listing("card x: broken").is_empty());
    }

    #[tokio::test]
    async fn locate_matches_identifier() {
        let probe = Arc::new(MockCardProbe::listing(parse_card_listing(APLAY_L)));
        let locator = CardLocator::new(probe, "ES8388", 9);
        assert_eq!(locator.locate().await, 3);
    }

    #[tokio::test]
    async fn locate_falls_back_when_nothing_matches() {
        let probe = Arc::new(MockCardProbe::listing(parse_card_listing(APLAY_L)));
        let locator = CardLocator::new(probe, "wm8960", 3);
        assert_eq!(locator.locate().await, 3);
    }

    #[tokio::test]
    async fn locate_falls_back_when_listing_fails() {
        let probe = Arc::new(MockCardProbe::failing("aplay: not found"));
        let locator = CardLocator::new(probe, "es8388", 3);
        assert_eq!(locator.locate().await, 3);
    }

    #[tokio::test]
    async fn fallback_probe_uses_secondary_on_error() {
        let primary = Arc::new(MockCardProbe::failing("no control interface"));
        let secondary = Arc::new(MockCardProbe::listing(vec![SoundCard {
            index: 1,
            description: "es8388".to_string(),
        }]));
        let probe = FallbackCardProbe::new(primary, secondary);
        let cards = probe.cards().await.unwrap();
        assert_eq!(cards[0].index, 1);
    }

    #[test]
    #[ignore = "requires ALSA hardware"]
    fn alsa_probe_lists_cards() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let cards = rt.block_on(AlsaCardProbe.cards()).unwrap();
        assert!(!cards.is_empty());
        for card in &cards {
            let handle = alsa::Card::new(i32::try_from(card.index).unwrap());
            assert!(has_playback_device(&handle), "card {} listed without playback", card.index);
        }
    }
}
