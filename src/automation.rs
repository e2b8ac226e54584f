//! Automation lanes: time-ordered breakpoints bound to one parameter.
//!
//! A lane either drives its parameter (playback) or records it. Which one is
//! decided per quantum from the lane mode plus three flags shared with the
//! real-time side: `recording`, `touching` and `latched`.
//!
//! Recording happens in passes. A pass starts at the first point it records
//! and owns the span from there to its cursor: every existing point in that
//! span is replaced. When the pass ends the lane gets a point restoring the
//! curve that was there before recording started, so a touch snaps back.

use crate::parameter::clamp_value;
use crate::types::{BusId, EffectId, LaneId, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutomationMode {
    /// Lane drives the parameter.
    #[default]
    Read,
    /// While recording, every quantum overwrites the lane with the live value.
    Write,
    /// Like `Write`, but only while the host holds a touch.
    Touch,
    /// Like `Touch`, but keeps writing after release until the transport stops.
    Latch,
}

/// The parameter a lane is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamTarget {
    Effect { effect: EffectId, parameter: String },
    Volume { node: NodeId },
    Pan { node: NodeId },
    Send { node: NodeId, bus: BusId },
}

impl fmt::Display for ParamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamTarget::Effect { effect, parameter } => write!(f, "{effect}.{parameter}"),
            ParamTarget::Volume { node } => write!(f, "{node}.volume"),
            ParamTarget::Pan { node } => write!(f, "{node}.pan"),
            ParamTarget::Send { node, bus } => write!(f, "{node}.send[{bus}]"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutomationPoint {
    /// Position in samples from the project start.
    pub time: u64,
    pub value: f64,
}

/// Linear interpolation between the two points surrounding `time`, clamped to `[min, max]`.
///
/// Before the first point the first value holds; after the last, the last value holds.
pub fn interpolate(points: &[AutomationPoint], time: u64, min: f64, max: f64) -> Option<f64> {
    let first = points.first()?;
    let idx = points.partition_point(|p| p.time <= time);
    let value = if idx == 0 {
        first.value
    } else if idx == points.len() {
        points[idx - 1].value
    } else {
        let a = points[idx - 1];
        let b = points[idx];
        let t = (time - a.time) as f64 / (b.time - a.time) as f64;
        a.value + (b.value - a.value) * t
    };
    Some(clamp_value(value, min, max, min))
}

/// Flags the real-time side reads to decide between playback and recording.
#[derive(Debug, Default)]
pub struct LaneFlags {
    recording: AtomicBool,
    touching: AtomicBool,
    latched: AtomicBool,
}

impl LaneFlags {
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn is_touching(&self) -> bool {
        self.touching.load(Ordering::Acquire)
    }

    pub fn is_latched(&self) -> bool {
        self.latched.load(Ordering::Acquire)
    }

    /// True while `mode` wants the live value written into the lane.
    #[inline]
    pub fn is_writing(&self, mode: AutomationMode) -> bool {
        if !self.is_recording() {
            return false;
        }
        match mode {
            AutomationMode::Read => false,
            AutomationMode::Write => true,
            AutomationMode::Touch => self.is_touching(),
            AutomationMode::Latch => self.is_touching() || self.is_latched(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Pass {
    cursor: u64,
    wrote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationLane {
    pub id: LaneId,
    pub target: ParamTarget,
    pub mode: AutomationMode,
    /// Bounds of the bound parameter.
    pub min: f64,
    pub max: f64,
    points: Vec<AutomationPoint>,
    #[serde(skip)]
    flags: Arc<LaneFlags>,
    #[serde(skip)]
    pass: Option<Pass>,
    /// The curve as it was when recording started.
    #[serde(skip)]
    original: Vec<AutomationPoint>,
}

impl AutomationLane {
    pub fn new(id: LaneId, target: ParamTarget, min: f64, max: f64) -> Self {
        Self {
            id,
            target,
            mode: AutomationMode::Read,
            min,
            max,
            points: Vec::new(),
            flags: Arc::default(),
            pass: None,
            original: Vec::new(),
        }
    }

    pub fn points(&self) -> &[AutomationPoint] {
        &self.points
    }

    pub fn flags(&self) -> Arc<LaneFlags> {
        Arc::clone(&self.flags)
    }

    pub fn is_recording(&self) -> bool {
        self.flags.is_recording()
    }

    pub fn is_writing(&self) -> bool {
        self.flags.is_writing(self.mode)
    }

    /// True when a direct write to the bound parameter must be refused.
    pub fn owns_value(&self) -> bool {
        !self.points.is_empty() && !self.is_writing()
    }

    pub fn value_at(&self, time: u64) -> Option<f64> {
        interpolate(&self.points, time, self.min, self.max)
    }

    /// Offline edit: add or replace the point at `time`. Returns the stored value.
    pub fn insert_point(&mut self, time: u64, value: f64) -> f64 {
        let value = clamp_value(value, self.min, self.max, self.min);
        let idx = self.points.partition_point(|p| p.time < time);
        match self.points.get_mut(idx) {
            Some(p) if p.time == time => p.value = value,
            _ => self.points.insert(idx, AutomationPoint { time, value }),
        }
        value
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.pass = None;
    }

    /// Append a recorded point.
    ///
    /// Points strictly before the last committed point (the pass cursor while
    /// recording, the final point otherwise) are ignored and `false` is
    /// returned. A point at the same time replaces the value.
    pub fn record_point(&mut self, time: u64, value: f64) -> bool {
        if value.is_nan() {
            return false;
        }
        let value = clamp_value(value, self.min, self.max, self.min);

        if self.pass.is_none() && self.is_recording() {
            self.pass = Some(Pass {
                cursor: time,
                wrote: false,
            });
        }

        let Some(pass) = self.pass else {
            return match self.points.last_mut() {
                Some(last) if time < last.time => false,
                Some(last) if time == last.time => {
                    last.value = value;
                    true
                }
                _ => {
                    self.points.push(AutomationPoint { time, value });
                    true
                }
            };
        };

        if time < pass.cursor {
            return false;
        }
        // Replace everything the pass has swept since its last point.
        let from = if pass.wrote { pass.cursor + 1 } else { pass.cursor };
        if pass.wrote && time == pass.cursor {
            if let Some(p) = self.points.iter_mut().find(|p| p.time == time) {
                p.value = value;
            }
        } else {
            self.points.retain(|p| p.time < from || p.time > time);
            let idx = self.points.partition_point(|p| p.time < time);
            self.points.insert(idx, AutomationPoint { time, value });
        }
        self.pass = Some(Pass {
            cursor: time,
            wrote: true,
        });
        true
    }

    pub fn begin_recording(&mut self) {
        self.original = self.points.clone();
        self.pass = None;
        self.flags.recording.store(true, Ordering::Release);
    }

    /// Stop recording. `position` is where the transport is now.
    pub fn end_recording(&mut self, position: u64) {
        self.flags.recording.store(false, Ordering::Release);
        self.flags.touching.store(false, Ordering::Release);
        self.flags.latched.store(false, Ordering::Release);
        self.end_pass(position);
        self.original.clear();
    }

    pub fn touch_begin(&mut self) {
        self.flags.touching.store(true, Ordering::Release);
        if self.mode == AutomationMode::Latch {
            self.flags.latched.store(true, Ordering::Release);
        }
    }

    pub fn touch_end(&mut self, position: u64) {
        self.flags.touching.store(false, Ordering::Release);
        if self.mode == AutomationMode::Touch {
            self.end_pass(position);
        }
    }

    /// Transport stopped: a latched lane stops writing.
    pub fn release_latch(&mut self, position: u64) {
        if self.flags.latched.swap(false, Ordering::AcqRel) {
            self.end_pass(position);
        }
    }

    /// Close the current pass and restore the pre-recording curve after it.
    fn end_pass(&mut self, position: u64) {
        let Some(pass) = self.pass.take() else {
            return;
        };
        if !pass.wrote || position <= pass.cursor {
            return;
        }
        if let Some(value) = interpolate(&self.original, position, self.min, self.max) {
            self.points.retain(|p| p.time <= pass.cursor || p.time > position);
            let idx = self.points.partition_point(|p| p.time < position);
            match self.points.get_mut(idx) {
                Some(p) if p.time == position => p.value = value,
                _ => self.points.insert(idx, AutomationPoint { time: position, value }),
            }
        }
    }

    /// Restore invariants after deserialization: sorted, unique times, in bounds.
    pub(crate) fn normalize(&mut self) {
        if self.min > self.max {
            std::mem::swap(&mut self.min, &mut self.max);
        }
        self.points.retain(|p| !p.value.is_nan());
        self.points.sort_by_key(|p| p.time);
        // keep the last of any duplicate times
        self.points.reverse();
        self.points.dedup_by_key(|p| p.time);
        self.points.reverse();
        for p in &mut self.points {
            p.value = clamp_value(p.value, self.min, self.max, self.min);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrackId;

    fn lane() -> AutomationLane {
        AutomationLane::new(
            LaneId::from_raw(1),
            ParamTarget::Volume {
                node: TrackId::from_raw(1).into(),
            },
            -96.0,
            12.0,
        )
    }

    fn times(lane: &AutomationLane) -> Vec<u64> {
        lane.points().iter().map(|p| p.time).collect()
    }

    fn strictly_ordered(lane: &AutomationLane) -> bool {
        lane.points().windows(2).all(|w| w[0].time < w[1].time)
    }

    #[test]
    fn interpolates_linearly_and_clamps() {
        let mut l = lane();
        l.insert_point(0, -12.0);
        l.insert_point(100, 0.0);
        assert_eq!(l.value_at(50), Some(-6.0));
        assert_eq!(l.value_at(0), Some(-12.0));
        assert_eq!(l.value_at(1000), Some(0.0));

        let pts = [
            AutomationPoint { time: 0, value: 0.0 },
            AutomationPoint { time: 10, value: 100.0 },
        ];
        assert_eq!(interpolate(&pts, 10, 0.0, 1.0), Some(1.0));
        assert_eq!(interpolate(&[], 10, 0.0, 1.0), None);
    }

    #[test]
    fn record_point_ignores_the_past() {
        let mut l = lane();
        assert!(l.record_point(100, -6.0));
        assert!(!l.record_point(50, -3.0));
        assert!(l.record_point(100, -4.0));
        assert!(l.record_point(200, -2.0));
        assert_eq!(times(&l), vec![100, 200]);
        assert_eq!(l.points()[0].value, -4.0);
    }

    #[test]
    fn write_pass_replaces_swept_points_only() {
        let mut l = lane();
        for t in [0, 100, 200, 300, 400] {
            l.insert_point(t, -10.0);
        }
        l.mode = AutomationMode::Write;
        l.begin_recording();
        assert!(l.record_point(150, 0.0));
        assert!(l.record_point(250, 1.0));
        assert!(!l.record_point(240, 5.0));
        l.end_recording(260);

        assert!(strictly_ordered(&l));
        assert_eq!(times(&l), vec![0, 100, 150, 250, 260, 300, 400]);
        // punch-out restores the previous curve
        assert_eq!(l.value_at(260), Some(-10.0));
    }

    #[test]
    fn recorded_values_clamp_to_parameter_bounds() {
        let mut l = lane();
        l.record_point(0, 50.0);
        assert_eq!(l.points()[0].value, 12.0);
        assert!(!l.record_point(10, f64::NAN));
    }

    #[test]
    fn touch_writes_only_while_touched() {
        let mut l = lane();
        l.insert_point(0, -20.0);
        l.mode = AutomationMode::Touch;
        l.begin_recording();
        assert!(!l.is_writing());
        assert!(l.owns_value());

        l.touch_begin();
        assert!(l.is_writing());
        assert!(!l.owns_value());
        l.record_point(100, 0.0);
        l.record_point(200, 3.0);
        l.touch_end(300);
        assert!(!l.is_writing());
        // snapped back to the pre-touch value
        assert_eq!(l.value_at(300), Some(-20.0));
        assert!(strictly_ordered(&l));
    }

    #[test]
    fn latch_keeps_writing_until_released() {
        let mut l = lane();
        l.mode = AutomationMode::Latch;
        l.begin_recording();
        l.touch_begin();
        l.touch_end(100);
        assert!(l.is_writing());
        l.release_latch(200);
        assert!(!l.is_writing());
    }

    #[test]
    fn empty_lane_never_owns_value() {
        let l = lane();
        assert!(!l.owns_value());
    }

    #[test]
    fn normalize_sorts_and_dedups() {
        let json = r#"{"id":1,"target":{"kind":"pan","node":{"kind":"track","id":1}},
            "mode":"read","min":-1.0,"max":1.0,
            "points":[{"time":20,"value":0.5},{"time":10,"value":9.0},{"time":20,"value":-0.5}]}"#;
        let mut l: AutomationLane = serde_json::from_str(json).unwrap();
        l.normalize();
        assert_eq!(times(&l), vec![10, 20]);
        assert_eq!(l.points()[0].value, 1.0);
        assert_eq!(l.points()[1].value, -0.5);
    }

    #[test]
    fn ordering_holds_for_arbitrary_record_sequences() {
        let mut rng = fastrand::Rng::with_seed(7);
        for mode in [AutomationMode::Write, AutomationMode::Touch, AutomationMode::Latch] {
            let mut l = lane();
            for t in 0..20 {
                l.insert_point(t * 50, -6.0);
            }
            l.mode = mode;
            l.begin_recording();
            l.touch_begin();
            for _ in 0..500 {
                l.record_point(rng.u64(0..1000), rng.f64() * 20.0 - 10.0);
                assert!(strictly_ordered(&l), "{mode:?}");
            }
            l.end_recording(1000);
            assert!(strictly_ordered(&l), "{mode:?}");
        }
    }
}
