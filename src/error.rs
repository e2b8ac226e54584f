use crate::types::{BusId, EffectId, LaneId, NodeId, Region, TrackId, TrackKind};
use thiserror::Error;

/// Umbrella error for host commands.
///
/// Structural and parameter errors are synchronous: the command is rejected,
/// engine state is unchanged, and the caller may retry with corrected input.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Cycle(#[from] CycleError),
    #[error(transparent)]
    AutomationLock(#[from] AutomationLockError),
    #[error(transparent)]
    OfflineRender(#[from] OfflineRenderFailure),
    #[error("unknown track {0}")]
    UnknownTrack(TrackId),
    #[error("unknown bus {0}")]
    UnknownBus(BusId),
    #[error("unknown effect {0}")]
    UnknownEffect(EffectId),
    #[error("effect {effect} has no parameter '{name}'")]
    UnknownParameter { effect: EffectId, name: String },
    #[error("{track} is an {kind:?} track")]
    WrongTrackKind { track: TrackId, kind: TrackKind },
    #[error("{0} is a bus; solo applies to tracks")]
    BusSolo(BusId),
    #[error("unknown automation lane {0}")]
    UnknownLane(LaneId),
    #[error("{what} capacity of {limit} exceeded")]
    CapacityExceeded { what: &'static str, limit: usize },
    #[error("invalid routing from {from} to {to}: {reason}")]
    InvalidRouting {
        from: NodeId,
        to: NodeId,
        reason: &'static str,
    },
    #[error("project document error: {0}")]
    Project(String),
}

/// Routing would create a feedback loop. The graph is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("connecting {from} to {to} would create a cycle")]
pub struct CycleError {
    pub from: NodeId,
    pub to: NodeId,
}

/// A direct parameter write was rejected because a lane in `read` mode owns the value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("parameter '{parameter}' is driven by automation lane {lane}")]
pub struct AutomationLockError {
    pub lane: LaneId,
    pub parameter: String,
}

/// Where an offline render was when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStage {
    /// Sizing and allocating the output buffer.
    Allocate,
    /// Running the per-quantum pipeline.
    Process,
    /// Mastering chain and normalisation.
    Master,
    /// Sample-format conversion and container encoding.
    Encode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Cancelled,
    OutOfMemory,
    /// Requested length (in frames) is above the configured maximum.
    TooLong { frames: u64, limit: u64 },
    Encode(String),
}

/// An offline render or export did not complete.
///
/// No partial buffer is ever handed out alongside this error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("offline render of {region} failed during {stage:?}: {reason:?}")]
pub struct OfflineRenderFailure {
    pub stage: RenderStage,
    pub region: Region,
    pub reason: FailureReason,
}

impl OfflineRenderFailure {
    pub fn new(stage: RenderStage, region: Region, reason: FailureReason) -> Self {
        Self {
            stage,
            region,
            reason,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason == FailureReason::Cancelled
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_converts_and_displays() {
        let err: EngineError = CycleError {
            from: NodeId::Bus(BusId::from_raw(2)),
            to: BusId::from_raw(1).into(),
        }
        .into();
        assert!(matches!(err, EngineError::Cycle(_)));
        assert_eq!(
            err.to_string(),
            "connecting bus#2 to bus#1 would create a cycle"
        );
    }

    #[test]
    fn offline_failure_reports_region() {
        let err = OfflineRenderFailure::new(
            RenderStage::Process,
            Region::new(0, 480),
            FailureReason::Cancelled,
        );
        assert!(err.is_cancelled());
        assert!(err.to_string().contains("[0, 480)"));
    }
}
