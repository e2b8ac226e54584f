//! Outbound notifications and the queues that carry them.
//!
//! Nothing here calls back into host code. The real-time side pushes small
//! `Copy` messages into `rtrb` queues; the host drains everything through
//! [`Engine::drain_events`](crate::engine::Engine::drain_events) on its own thread.

use crate::effect::EffectType;
use crate::types::{BusId, EffectId, LaneId, NodeId, Region, TrackId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    TrackAdded(TrackId),
    TrackRemoved(TrackId),
    BusAdded(BusId),
    BusRemoved(BusId),
    RoutingChanged,
    EffectInserted { owner: NodeId, effect: EffectId, kind: EffectType },
    EffectRemoved(EffectId),
    ClipsChanged(TrackId),
    NotesChanged(TrackId),
    /// Points recorded by the real-time side were merged into a lane.
    AutomationRecorded { lane: LaneId, points: usize },
    /// The real-time side recorded faster than the host drained; points were lost.
    AutomationOverflow { points: u64 },
    TransportChanged { playing: bool, position: u64 },
    LoopWrapped { position: u64 },
    /// A quantum missed its deadline. Playback went on.
    Dropout { position: u64, late_micros: u64 },
    RenderFinished { region: Region, ok: bool },
    ProjectLoaded,
}

/// Real-time → host messages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RtEvent {
    Dropout { position: u64, late_micros: u64 },
    LoopWrapped { position: u64 },
}

/// One automation sample captured by the real-time side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordedPoint {
    pub lane: LaneId,
    pub time: u64,
    pub value: f64,
}

/// Control-side event queue. Shared with background render threads.
#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    inner: Arc<Mutex<VecDeque<EngineEvent>>>,
}

impl EventQueue {
    pub fn push(&self, event: EngineEvent) {
        self.inner.lock().push_back(event);
    }

    pub fn drain(&self) -> Vec<EngineEvent> {
        self.inner.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_drains_in_order_across_clones() {
        let q = EventQueue::default();
        let other = q.clone();
        q.push(EngineEvent::RoutingChanged);
        other.push(EngineEvent::TrackAdded(TrackId::from_raw(1)));
        assert_eq!(q.len(), 2);
        assert_eq!(
            q.drain(),
            vec![EngineEvent::RoutingChanged, EngineEvent::TrackAdded(TrackId::from_raw(1))]
        );
        assert!(other.is_empty());
    }
}
