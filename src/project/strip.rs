//! Channel strips: fader, pan, switches, insert chain and sends.

use crate::config::EngineConfig;
use crate::effect::EffectChain;
use crate::parameter::Parameter;
use crate::types::BusId;
use serde::{Deserialize, Serialize};

/// A post-fader copy of the strip's output into another bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendLevel {
    pub bus: BusId,
    /// Level in dB.
    pub level: Parameter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStrip {
    /// Fader in dB, bounded by the engine's volume range.
    pub volume: Parameter,
    /// Balance in `[-1, 1]`.
    pub pan: Parameter,
    #[serde(default)]
    pub mute: bool,
    #[serde(default)]
    pub solo: bool,
    #[serde(default)]
    pub armed: bool,
    #[serde(default)]
    pub chain: EffectChain,
    #[serde(default)]
    pub sends: Vec<SendLevel>,
}

impl ChannelStrip {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            volume: Self::level_parameter("volume", config),
            pan: Parameter::new("pan", -1.0, 1.0, 0.0, ""),
            mute: false,
            solo: false,
            armed: false,
            chain: EffectChain::new(),
            sends: Vec::new(),
        }
    }

    fn level_parameter(name: &str, config: &EngineConfig) -> Parameter {
        let default = 0.0f64.clamp(config.min_volume_db, config.max_volume_db);
        Parameter::new(name, config.min_volume_db, config.max_volume_db, default, "dB")
    }

    pub fn send(&self, bus: BusId) -> Option<&SendLevel> {
        self.sends.iter().find(|s| s.bus == bus)
    }

    /// The send into `bus`, created at unity if missing.
    pub fn send_or_insert(&mut self, bus: BusId, config: &EngineConfig) -> &SendLevel {
        let index = match self.sends.iter().position(|s| s.bus == bus) {
            Some(i) => i,
            None => {
                self.sends.push(SendLevel {
                    bus,
                    level: Self::level_parameter("send", config),
                });
                self.sends.len() - 1
            }
        };
        &self.sends[index]
    }

    pub fn remove_send(&mut self, bus: BusId) -> Option<SendLevel> {
        let index = self.sends.iter().position(|s| s.bus == bus)?;
        Some(self.sends.remove(index))
    }

    pub(crate) fn normalize(&mut self) {
        self.volume.normalize();
        self.pan.normalize();
        for unit in self.chain.units_mut() {
            unit.normalize();
        }
        for send in &mut self.sends {
            send.level.normalize();
        }
        let mut seen = Vec::with_capacity(self.sends.len());
        self.sends.retain(|s| {
            let fresh = !seen.contains(&s.bus);
            seen.push(s.bus);
            fresh
        });
    }
}
