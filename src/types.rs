//! Identifiers and small value types shared across the engine.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Get the raw ID value (for serialization)
            pub fn raw(&self) -> u32 {
                self.0
            }

            /// Create from raw ID value (for deserialization)
            pub fn from_raw(id: u32) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Identifier of a track inside a project.
    TrackId,
    "track#"
);
define_id!(
    /// Identifier of a bus. `BusId::MASTER` always exists.
    BusId,
    "bus#"
);
define_id!(
    /// Identifier of an effect unit, unique across the whole project.
    EffectId,
    "fx#"
);
define_id!(
    /// Identifier of an automation lane.
    LaneId,
    "lane#"
);

impl BusId {
    /// The master bus. Created with every project and never removed.
    pub const MASTER: BusId = BusId(0);

    pub fn is_master(&self) -> bool {
        *self == Self::MASTER
    }
}

/// A vertex of the signal graph: either a track or a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum NodeId {
    Track(TrackId),
    Bus(BusId),
}

impl NodeId {
    pub fn as_track(&self) -> Option<TrackId> {
        match self {
            NodeId::Track(id) => Some(*id),
            NodeId::Bus(_) => None,
        }
    }

    pub fn as_bus(&self) -> Option<BusId> {
        match self {
            NodeId::Bus(id) => Some(*id),
            NodeId::Track(_) => None,
        }
    }
}

impl From<TrackId> for NodeId {
    fn from(id: TrackId) -> Self {
        NodeId::Track(id)
    }
}

impl From<BusId> for NodeId {
    fn from(id: BusId) -> Self {
        NodeId::Bus(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Track(id) => id.fmt(f),
            NodeId::Bus(id) => id.fmt(f),
        }
    }
}

/// What a track renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Plays audio clips.
    Audio,
    /// Plays MIDI notes through the built-in voice synthesiser.
    Midi,
    /// No content of its own; listens to an optional bus tap.
    Aux,
}

/// Musical meter. Only used for bar/beat conversions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignature {
    pub numerator: u8,
    pub denominator: u8,
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self {
            numerator: 4,
            denominator: 4,
        }
    }
}

/// A span of the timeline in samples, `[start, start + frames)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Region {
    pub start: u64,
    pub frames: u64,
}

impl Region {
    pub fn new(start: u64, frames: u64) -> Self {
        Self { start, frames }
    }

    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.frames)
    }

    pub fn contains(&self, position: u64) -> bool {
        position >= self.start && position < self.end()
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}

/// Convert seconds to a whole number of frames, rounding up.
pub fn seconds_to_frames(seconds: f64, sample_rate: f64) -> u64 {
    if seconds <= 0.0 || !seconds.is_finite() {
        0
    } else {
        (seconds * sample_rate).ceil() as u64
    }
}
