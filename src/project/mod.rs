//! The project model: tracks, buses, routing and automation lanes.
//!
//! This is the control-side source of truth. It is only ever touched by the
//! host thread; the real-time side sees immutable snapshots built from it.

pub mod clip;
pub mod strip;

pub use clip::{Clip, ClipAudio, Humanize, MidiNote};
pub use strip::{ChannelStrip, SendLevel};

use crate::automation::{AutomationLane, ParamTarget};
use crate::config::EngineConfig;
use crate::dsp::voice::Instrument;
use crate::effect::{EffectType, EffectUnit};
use crate::error::{AutomationLockError, EngineError, Result};
use crate::graph::{EdgeKind, SignalGraph};
use crate::parameter::Parameter;
use crate::types::{BusId, EffectId, LaneId, NodeId, TimeSignature, TrackId, TrackKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub name: String,
    pub kind: TrackKind,
    pub strip: ChannelStrip,
    #[serde(default)]
    pub clips: Vec<Clip>,
    #[serde(default)]
    pub notes: Vec<MidiNote>,
    #[serde(default)]
    pub instrument: Instrument,
    #[serde(default)]
    pub humanize: Option<Humanize>,
    /// Rendered note list. Dropped whenever the notes or the synth change.
    #[serde(skip)]
    rendered: Option<Clip>,
}

impl Track {
    fn new(id: TrackId, name: String, kind: TrackKind, config: &EngineConfig) -> Self {
        Self {
            id,
            name,
            kind,
            strip: ChannelStrip::new(config),
            clips: Vec::new(),
            notes: Vec::new(),
            instrument: Instrument::default(),
            humanize: None,
            rendered: None,
        }
    }

    pub(crate) fn invalidate_render(&mut self) {
        self.rendered = None;
    }

    /// Seed for this track's humanisation stream.
    fn seed(&self, project_seed: u64) -> u64 {
        project_seed ^ (self.id.raw() as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }

    fn render_midi(&mut self, project_seed: u64, sample_rate: f64) {
        if self.kind != TrackKind::Midi || self.rendered.is_some() || self.notes.is_empty() {
            return;
        }
        let seed = self.seed(project_seed);
        self.rendered = clip::render_notes(&self.notes, &self.instrument, self.humanize, seed, sample_rate)
            .map(|(start, audio)| Clip::new(start, audio));
        log::debug!("rendered {} notes on {}", self.notes.len(), self.id);
    }

    /// Everything this track plays: its clips, or its rendered notes.
    pub fn sources(&self) -> impl Iterator<Item = &Clip> {
        self.clips.iter().chain(self.rendered.iter())
    }

    /// Last sample this track produces before effect tails.
    pub fn content_end(&self) -> u64 {
        let clips = self.sources().map(Clip::end).max().unwrap_or(0);
        let notes = self.notes.iter().map(|n| n.start + n.length).max().unwrap_or(0);
        clips.max(notes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bus {
    pub id: BusId,
    pub name: String,
    pub strip: ChannelStrip,
}

/// Tempo, meter and loop, as saved with the project.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub bpm: f64,
    pub time_signature: TimeSignature,
    pub loop_start: u64,
    pub loop_end: u64,
    pub loop_enabled: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            bpm: 120.0,
            time_signature: TimeSignature::default(),
            loop_start: 0,
            loop_end: 0,
            loop_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct IdCounters {
    track: u32,
    bus: u32,
    effect: u32,
    lane: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    /// Seeds every source of variation (humanisation). Never taken from the clock.
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub transport: TransportSettings,
    tracks: Vec<Track>,
    buses: Vec<Bus>,
    graph: SignalGraph,
    #[serde(default)]
    lanes: Vec<AutomationLane>,
    #[serde(skip)]
    ids: IdCounters,
}

impl Project {
    /// A project holding only the master bus.
    pub fn new(name: impl Into<String>, config: &EngineConfig) -> Self {
        let mut graph = SignalGraph::new();
        graph.add_node(NodeId::Bus(BusId::MASTER));
        Self {
            name: name.into(),
            seed: 0,
            transport: TransportSettings::default(),
            tracks: Vec::new(),
            buses: vec![Bus {
                id: BusId::MASTER,
                name: "Master".to_string(),
                strip: ChannelStrip::new(config),
            }],
            graph,
            lanes: Vec::new(),
            ids: IdCounters {
                track: 1,
                bus: 1,
                effect: 1,
                lane: 1,
            },
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn buses(&self) -> &[Bus] {
        &self.buses
    }

    pub fn graph(&self) -> &SignalGraph {
        &self.graph
    }

    /// Processing order of the routing graph, cached until routing changes.
    pub fn processing_order(&mut self) -> Vec<NodeId> {
        self.graph.topological_order().to_vec()
    }

    pub fn lanes(&self) -> &[AutomationLane] {
        &self.lanes
    }

    pub(crate) fn lanes_mut(&mut self) -> &mut [AutomationLane] {
        &mut self.lanes
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn track_mut(&mut self, id: TrackId) -> Result<&mut Track> {
        self.tracks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(EngineError::UnknownTrack(id))
    }

    pub fn bus(&self, id: BusId) -> Option<&Bus> {
        self.buses.iter().find(|b| b.id == id)
    }

    pub fn lane(&self, id: LaneId) -> Option<&AutomationLane> {
        self.lanes.iter().find(|l| l.id == id)
    }

    pub fn lane_mut(&mut self, id: LaneId) -> Result<&mut AutomationLane> {
        self.lanes
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or(EngineError::UnknownLane(id))
    }

    pub fn contains(&self, node: NodeId) -> bool {
        match node {
            NodeId::Track(id) => self.track(id).is_some(),
            NodeId::Bus(id) => self.bus(id).is_some(),
        }
    }

    fn require(&self, node: NodeId) -> Result<()> {
        match node {
            NodeId::Track(id) if self.track(id).is_none() => Err(EngineError::UnknownTrack(id)),
            NodeId::Bus(id) if self.bus(id).is_none() => Err(EngineError::UnknownBus(id)),
            _ => Ok(()),
        }
    }

    pub fn strip(&self, node: NodeId) -> Option<&ChannelStrip> {
        match node {
            NodeId::Track(id) => self.track(id).map(|t| &t.strip),
            NodeId::Bus(id) => self.bus(id).map(|b| &b.strip),
        }
    }

    pub fn strip_mut(&mut self, node: NodeId) -> Result<&mut ChannelStrip> {
        match node {
            NodeId::Track(id) => self.track_mut(id).map(|t| &mut t.strip),
            NodeId::Bus(id) => self
                .buses
                .iter_mut()
                .find(|b| b.id == id)
                .map(|b| &mut b.strip)
                .ok_or(EngineError::UnknownBus(id)),
        }
    }

    /// Every strip with its node, tracks first.
    pub fn strips(&self) -> impl Iterator<Item = (NodeId, &ChannelStrip)> {
        self.tracks
            .iter()
            .map(|t| (NodeId::Track(t.id), &t.strip))
            .chain(self.buses.iter().map(|b| (NodeId::Bus(b.id), &b.strip)))
    }

    fn strips_mut(&mut self) -> impl Iterator<Item = (NodeId, &mut ChannelStrip)> {
        self.tracks
            .iter_mut()
            .map(|t| (NodeId::Track(t.id), &mut t.strip))
            .chain(self.buses.iter_mut().map(|b| (NodeId::Bus(b.id), &mut b.strip)))
    }

    pub fn node_count(&self) -> usize {
        self.tracks.len() + self.buses.len()
    }

    /// Add a track routed to the master bus.
    pub fn add_track(&mut self, name: impl Into<String>, kind: TrackKind, config: &EngineConfig) -> Result<TrackId> {
        if self.node_count() >= config.max_nodes {
            return Err(EngineError::CapacityExceeded {
                what: "node",
                limit: config.max_nodes,
            });
        }
        let id = TrackId::from_raw(self.ids.track);
        self.ids.track += 1;
        self.tracks.push(Track::new(id, name.into(), kind, config));
        self.graph.add_node(id.into());
        self.graph.connect(id.into(), BusId::MASTER)?;
        Ok(id)
    }

    /// Remove a track together with its effects and any lane targeting it.
    pub fn remove_track(&mut self, id: TrackId) -> Result<Track> {
        let index = self
            .tracks
            .iter()
            .position(|t| t.id == id)
            .ok_or(EngineError::UnknownTrack(id))?;
        let track = self.tracks.remove(index);
        self.graph.remove_node(id.into());
        let effects: Vec<EffectId> = track.strip.chain.iter().map(|u| u.id).collect();
        self.drop_lanes(|t| t.node() == Some(NodeId::Track(id)) || effects.iter().any(|e| t.effect() == Some(*e)));
        Ok(track)
    }

    /// Add a bus routed to the master bus.
    pub fn add_bus(&mut self, name: impl Into<String>, config: &EngineConfig) -> Result<BusId> {
        if self.node_count() >= config.max_nodes {
            return Err(EngineError::CapacityExceeded {
                what: "node",
                limit: config.max_nodes,
            });
        }
        let id = BusId::from_raw(self.ids.bus);
        self.ids.bus += 1;
        self.buses.push(Bus {
            id,
            name: name.into(),
            strip: ChannelStrip::new(config),
        });
        self.graph.add_node(id.into());
        self.graph.connect(id.into(), BusId::MASTER)?;
        Ok(id)
    }

    /// Remove a bus. Nodes that output into it fall back to the master bus;
    /// sends and aux inputs pointing at it are dropped.
    pub fn remove_bus(&mut self, id: BusId) -> Result<Bus> {
        if id.is_master() {
            return Err(EngineError::InvalidRouting {
                from: id.into(),
                to: id.into(),
                reason: "the master bus cannot be removed",
            });
        }
        let index = self
            .buses
            .iter()
            .position(|b| b.id == id)
            .ok_or(EngineError::UnknownBus(id))?;

        let orphans: Vec<NodeId> = self
            .graph
            .edges()
            .iter()
            .filter(|e| e.to == NodeId::Bus(id) && e.kind == EdgeKind::Output)
            .map(|e| e.from)
            .collect();
        let bus = self.buses.remove(index);
        self.graph.remove_node(id.into());
        for node in orphans {
            self.graph.connect(node, BusId::MASTER)?;
        }
        for (_, strip) in self.strips_mut() {
            strip.remove_send(id);
        }

        let effects: Vec<EffectId> = bus.strip.chain.iter().map(|u| u.id).collect();
        self.drop_lanes(|t| {
            t.node() == Some(NodeId::Bus(id))
                || matches!(t, ParamTarget::Send { bus, .. } if *bus == id)
                || effects.iter().any(|e| t.effect() == Some(*e))
        });
        Ok(bus)
    }

    /// Route `from`'s main output into `to`. The master bus has no output.
    pub fn connect(&mut self, from: NodeId, to: BusId) -> Result<()> {
        self.require(from)?;
        self.require(to.into())?;
        if from == NodeId::Bus(BusId::MASTER) {
            return Err(EngineError::InvalidRouting {
                from,
                to: to.into(),
                reason: "the master bus has no output",
            });
        }
        self.graph.connect(from, to)?;
        Ok(())
    }

    /// Remove the output edge `from -> to`.
    ///
    /// A track always has an output, so it falls back to the master bus and
    /// disconnecting it from master changes nothing. A bus may be left
    /// unrouted; only aux tracks tapping it hear it then.
    pub fn disconnect(&mut self, from: NodeId, to: BusId) -> bool {
        let is_track = matches!(from, NodeId::Track(_));
        if is_track && to.is_master() {
            return false;
        }
        if !self.graph.disconnect(from, to) {
            return false;
        }
        if is_track {
            if let Err(e) = self.graph.connect(from, BusId::MASTER) {
                log::warn!("could not reroute {from} to master: {e}");
            }
        }
        true
    }

    pub fn set_aux_input(&mut self, track: TrackId, bus: Option<BusId>) -> Result<()> {
        let kind = self.track(track).ok_or(EngineError::UnknownTrack(track))?.kind;
        if kind != TrackKind::Aux {
            return Err(EngineError::WrongTrackKind { track, kind });
        }
        if let Some(bus) = bus {
            self.require(bus.into())?;
        }
        self.graph.set_aux_input(track, bus)?;
        Ok(())
    }

    pub fn effect_count(&self) -> usize {
        self.strips().map(|(_, s)| s.chain.len()).sum()
    }

    /// Which node's chain holds `id`.
    pub fn effect_owner(&self, id: EffectId) -> Option<NodeId> {
        self.strips()
            .find(|(_, s)| s.chain.get(id).is_some())
            .map(|(node, _)| node)
    }

    pub fn effect(&self, id: EffectId) -> Option<&EffectUnit> {
        self.strips().find_map(|(_, s)| s.chain.get(id))
    }

    pub fn effect_mut(&mut self, id: EffectId) -> Result<&mut EffectUnit> {
        self.strips_mut()
            .find_map(|(_, s)| s.chain.get_mut(id))
            .ok_or(EngineError::UnknownEffect(id))
    }

    pub fn insert_effect(&mut self, owner: NodeId, kind: EffectType, index: usize) -> Result<EffectId> {
        let id = EffectId::from_raw(self.ids.effect);
        let strip = self.strip_mut(owner)?;
        strip.chain.insert(EffectUnit::new(id, kind), index);
        self.ids.effect += 1;
        Ok(id)
    }

    pub fn remove_effect(&mut self, id: EffectId) -> Result<EffectUnit> {
        let unit = self
            .strips_mut()
            .find_map(|(_, s)| s.chain.remove(id))
            .ok_or(EngineError::UnknownEffect(id))?;
        self.drop_lanes(|t| t.effect() == Some(id));
        Ok(unit)
    }

    pub fn reorder_effect(&mut self, id: EffectId, new_index: usize) -> Result<()> {
        let moved = self
            .strips_mut()
            .any(|(_, s)| s.chain.reorder(id, new_index));
        if moved {
            Ok(())
        } else {
            Err(EngineError::UnknownEffect(id))
        }
    }

    /// Create or update the send from `node` into `bus`. Returns the stored level.
    pub fn set_send(&mut self, node: NodeId, bus: BusId, level_db: f64, config: &EngineConfig) -> Result<f64> {
        self.require(node)?;
        self.require(bus.into())?;
        if node == NodeId::Bus(BusId::MASTER) {
            return Err(EngineError::InvalidRouting {
                from: node,
                to: bus.into(),
                reason: "the master bus has no sends",
            });
        }
        if let Some(send) = self.strip(node).and_then(|s| s.send(bus)) {
            if let Some(err) = self.lock_for(&send.level) {
                return Err(err.into());
            }
            return Ok(send.level.set(level_db));
        }
        self.graph.add_send(node, bus)?;
        let strip = self.strip_mut(node)?;
        Ok(strip.send_or_insert(bus, config).level.set(level_db))
    }

    pub fn remove_send(&mut self, node: NodeId, bus: BusId) -> Result<bool> {
        let removed = self.strip_mut(node)?.remove_send(bus).is_some();
        self.graph.remove_send(node, bus);
        self.drop_lanes(|t| matches!(t, ParamTarget::Send { node: n, bus: b } if *n == node && *b == bus));
        Ok(removed)
    }

    /// The parameter a lane target names.
    pub fn parameter(&self, target: &ParamTarget) -> Option<&Parameter> {
        match target {
            ParamTarget::Effect { effect, parameter } => self.effect(*effect)?.param(parameter),
            ParamTarget::Volume { node } => self.strip(*node).map(|s| &s.volume),
            ParamTarget::Pan { node } => self.strip(*node).map(|s| &s.pan),
            ParamTarget::Send { node, bus } => self.strip(*node)?.send(*bus).map(|s| &s.level),
        }
    }

    fn parameter_mut(&mut self, target: &ParamTarget) -> Result<&mut Parameter> {
        let err = self.missing(target);
        let found = match target {
            ParamTarget::Effect { effect, parameter } => self
                .strips_mut()
                .find_map(|(_, s)| s.chain.get_mut(*effect))
                .and_then(|u| u.param_mut(parameter)),
            ParamTarget::Volume { node } => self.strip_mut(*node).ok().map(|s| &mut s.volume),
            ParamTarget::Pan { node } => self.strip_mut(*node).ok().map(|s| &mut s.pan),
            ParamTarget::Send { node, bus } => self
                .strip_mut(*node)
                .ok()
                .and_then(|s| s.sends.iter_mut().find(|s| s.bus == *bus))
                .map(|s| &mut s.level),
        };
        found.ok_or(err)
    }

    fn missing(&self, target: &ParamTarget) -> EngineError {
        match target {
            ParamTarget::Effect { effect, parameter } => match self.effect(*effect) {
                Some(_) => EngineError::UnknownParameter {
                    effect: *effect,
                    name: parameter.clone(),
                },
                None => EngineError::UnknownEffect(*effect),
            },
            ParamTarget::Volume { node } | ParamTarget::Pan { node } => match self.require(*node) {
                Err(e) => e,
                Ok(()) => EngineError::Project(format!("{target} does not resolve")),
            },
            ParamTarget::Send { node, bus } => match self.require(*node).and(self.require((*bus).into())) {
                Err(e) => e,
                Ok(()) => EngineError::InvalidRouting {
                    from: *node,
                    to: (*bus).into(),
                    reason: "no send between these nodes",
                },
            },
        }
    }

    /// The lane that currently refuses direct writes to `param`, if any.
    pub fn lock_for(&self, param: &Parameter) -> Option<AutomationLockError> {
        let lane = self.lane(param.lane?)?;
        lane.owns_value().then(|| AutomationLockError {
            lane: lane.id,
            parameter: lane.target.to_string(),
        })
    }

    /// A direct host write: clamped, or refused while automation owns the value.
    pub fn set_target(&self, target: &ParamTarget, value: f64) -> Result<f64> {
        let param = self.parameter(target).ok_or_else(|| self.missing(target))?;
        if let Some(err) = self.lock_for(param) {
            return Err(err.into());
        }
        Ok(param.set(value))
    }

    pub fn set_effect_parameter(&self, id: EffectId, name: &str, value: f64) -> Result<f64> {
        let owner = self.effect_owner(id).ok_or(EngineError::UnknownEffect(id))?;
        let strip = self.strip(owner).ok_or(EngineError::UnknownEffect(id))?;
        strip.chain.set_parameter(id, name, value, |p| self.lock_for(p))
    }

    /// Bind a new lane to `target`. A target already automated keeps its lane.
    pub fn create_lane(&mut self, target: ParamTarget) -> Result<LaneId> {
        let id = LaneId::from_raw(self.ids.lane);
        let param = self.parameter_mut(&target)?;
        if let Some(existing) = param.lane {
            return Ok(existing);
        }
        param.lane = Some(id);
        let (min, max) = (param.min, param.max);
        self.lanes.push(AutomationLane::new(id, target, min, max));
        self.ids.lane += 1;
        Ok(id)
    }

    pub fn remove_lane(&mut self, id: LaneId) -> Result<AutomationLane> {
        let index = self
            .lanes
            .iter()
            .position(|l| l.id == id)
            .ok_or(EngineError::UnknownLane(id))?;
        let lane = self.lanes.remove(index);
        if let Ok(param) = self.parameter_mut(&lane.target) {
            param.lane = None;
        }
        Ok(lane)
    }

    fn drop_lanes(&mut self, doomed: impl Fn(&ParamTarget) -> bool) {
        let (gone, kept): (Vec<_>, Vec<_>) = self.lanes.drain(..).partition(|l| doomed(&l.target));
        self.lanes = kept;
        for lane in gone {
            if let Ok(param) = self.parameter_mut(&lane.target) {
                param.lane = None;
            }
            log::debug!("dropped automation lane {} ({})", lane.id, lane.target);
        }
    }

    pub fn set_solo(&mut self, node: NodeId, solo: bool) -> Result<()> {
        match node {
            NodeId::Track(id) => {
                self.track_mut(id)?.strip.solo = solo;
                Ok(())
            }
            NodeId::Bus(id) => {
                self.require(node)?;
                Err(EngineError::BusSolo(id))
            }
        }
    }

    pub fn any_solo(&self) -> bool {
        self.tracks.iter().any(|t| t.strip.solo)
    }

    /// Whether `node` reaches the output after mute and solo.
    ///
    /// Solo applies to tracks: while any track is soloed, every other track is
    /// silent. Stored mute flags are never touched by this.
    pub fn is_audible(&self, node: NodeId) -> bool {
        match node {
            NodeId::Track(id) => self
                .track(id)
                .is_some_and(|t| !t.strip.mute && (t.strip.solo || !self.any_solo())),
            NodeId::Bus(id) => self.bus(id).is_some_and(|b| !b.strip.mute),
        }
    }

    pub fn add_clip(&mut self, track: TrackId, clip: Clip) -> Result<()> {
        let t = self.track_mut(track)?;
        if t.kind != TrackKind::Audio {
            return Err(EngineError::WrongTrackKind { track, kind: t.kind });
        }
        t.clips.push(clip);
        t.clips.sort_by_key(|c| c.start);
        Ok(())
    }

    pub fn add_note(&mut self, track: TrackId, note: MidiNote) -> Result<()> {
        let t = self.track_mut(track)?;
        if t.kind != TrackKind::Midi {
            return Err(EngineError::WrongTrackKind { track, kind: t.kind });
        }
        t.notes.push(note);
        t.invalidate_render();
        Ok(())
    }

    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
        for t in &mut self.tracks {
            t.invalidate_render();
        }
    }

    /// Render any MIDI track whose cached audio is stale.
    pub fn prepare_sources(&mut self, sample_rate: f64) {
        let seed = self.seed;
        for t in &mut self.tracks {
            t.render_midi(seed, sample_rate);
        }
    }

    /// End of the last clip or note on any track.
    pub fn content_end(&self) -> u64 {
        self.tracks.iter().map(Track::content_end).max().unwrap_or(0)
    }

    /// Longest effect tail on any strip.
    pub fn tail_seconds(&self) -> f64 {
        self.strips().map(|(_, s)| s.chain.tail_seconds()).fold(0.0, f64::max)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| EngineError::Project(e.to_string()))
    }

    /// Parse and validate a saved project.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut project: Project = serde_json::from_str(json).map_err(|e| EngineError::Project(e.to_string()))?;
        project.validate()?;
        Ok(project)
    }

    /// Restore every invariant on a project that came from outside.
    fn validate(&mut self) -> Result<()> {
        if self.bus(BusId::MASTER).is_none() {
            return Err(EngineError::Project("project has no master bus".to_string()));
        }
        let nodes: Vec<NodeId> = self.strips().map(|(n, _)| n).collect();
        let mut seen = HashSet::new();
        for &node in &nodes {
            if !seen.insert(node) {
                return Err(EngineError::Project(format!("duplicate node {node}")));
            }
        }
        let mut effects = HashSet::new();
        for unit in self.strips().flat_map(|(_, s)| s.chain.iter()) {
            if !effects.insert(unit.id) {
                return Err(EngineError::Project(format!("duplicate effect {}", unit.id)));
            }
        }
        if let Some(unknown) = self.graph.nodes().iter().find(|n| !self.contains(**n)) {
            return Err(EngineError::Project(format!("routing references unknown node {unknown}")));
        }
        for node in nodes {
            self.graph.add_node(node);
        }

        for edge in self.graph.edges() {
            if edge.from == NodeId::Bus(BusId::MASTER) && edge.kind != EdgeKind::AuxInput {
                return Err(EngineError::InvalidRouting {
                    from: edge.from,
                    to: edge.to,
                    reason: "the master bus has no output",
                });
            }
            let valid = match edge.kind {
                EdgeKind::Output | EdgeKind::Send => edge.to.as_bus().is_some(),
                EdgeKind::AuxInput => {
                    edge.from.as_bus().is_some()
                        && edge
                            .to
                            .as_track()
                            .and_then(|t| self.track(t))
                            .is_some_and(|t| t.kind == TrackKind::Aux)
                }
            };
            if !valid {
                return Err(EngineError::InvalidRouting {
                    from: edge.from,
                    to: edge.to,
                    reason: "edge kind does not fit its endpoints",
                });
            }
        }
        self.graph.validate()?;

        // Strip sends are authoritative; rebuild the send edges from them.
        let sends: Vec<(NodeId, BusId)> = self
            .strips()
            .flat_map(|(node, s)| s.sends.iter().map(move |send| (node, send.bus)))
            .collect();
        let stale: Vec<(NodeId, BusId)> = self
            .graph
            .edges()
            .iter()
            .filter(|e| e.kind == EdgeKind::Send)
            .filter_map(|e| Some((e.from, e.to.as_bus()?)))
            .collect();
        for (from, to) in stale {
            self.graph.remove_send(from, to);
        }
        for (from, to) in sends {
            self.require(to.into())?;
            self.graph.add_send(from, to)?;
        }

        for (_, strip) in self.strips_mut() {
            strip.normalize();
        }

        // Lanes are authoritative for bindings; drop lanes that resolve to nothing.
        for (_, strip) in self.strips_mut() {
            strip.volume.lane = None;
            strip.pan.lane = None;
            for send in &mut strip.sends {
                send.level.lane = None;
            }
            for unit in strip.chain.units_mut() {
                unit.mix.lane = None;
                for p in &mut unit.params {
                    p.lane = None;
                }
            }
        }
        let lanes = std::mem::take(&mut self.lanes);
        for mut lane in lanes {
            let Ok(param) = self.parameter_mut(&lane.target) else {
                log::warn!("dropping lane {}: {} does not resolve", lane.id, lane.target);
                continue;
            };
            if param.lane.is_some() {
                log::warn!("dropping lane {}: {} is already automated", lane.id, lane.target);
                continue;
            }
            param.lane = Some(lane.id);
            lane.min = param.min;
            lane.max = param.max;
            lane.normalize();
            self.lanes.push(lane);
        }

        self.transport.bpm = crate::transport::clamp_bpm(self.transport.bpm);
        self.ids = IdCounters {
            track: self.tracks.iter().map(|t| t.id.raw() + 1).max().unwrap_or(1),
            bus: self.buses.iter().map(|b| b.id.raw() + 1).max().unwrap_or(1),
            effect: effects.iter().map(|e| e.raw() + 1).max().unwrap_or(1),
            lane: self.lanes.iter().map(|l| l.id.raw() + 1).max().unwrap_or(1),
        };
        Ok(())
    }
}

impl ParamTarget {
    /// The strip this target lives on, for strip-level targets.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            ParamTarget::Volume { node } | ParamTarget::Pan { node } | ParamTarget::Send { node, .. } => Some(*node),
            ParamTarget::Effect { .. } => None,
        }
    }

    pub fn effect(&self) -> Option<EffectId> {
        match self {
            ParamTarget::Effect { effect, .. } => Some(*effect),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::AutomationMode;
    use std::sync::Arc;

    fn rendered(p: &Project, id: TrackId) -> Option<Arc<ClipAudio>> {
        p.track(id)?.rendered.as_ref().map(|c| Arc::clone(&c.audio))
    }

    fn setup() -> (Project, EngineConfig) {
        let config = EngineConfig::default();
        (Project::new("test", &config), config)
    }

    #[test]
    fn new_tracks_route_to_master() {
        let (mut p, config) = setup();
        let t = p.add_track("A", TrackKind::Audio, &config).unwrap();
        assert_eq!(p.graph().output_of(t.into()), Some(BusId::MASTER));
        let b = p.add_bus("Drums", &config).unwrap();
        assert_eq!(p.graph().output_of(b.into()), Some(BusId::MASTER));
    }

    #[test]
    fn master_cannot_be_removed_or_routed() {
        let (mut p, config) = setup();
        let b = p.add_bus("B", &config).unwrap();
        assert!(matches!(p.remove_bus(BusId::MASTER), Err(EngineError::InvalidRouting { .. })));
        assert!(matches!(
            p.connect(BusId::MASTER.into(), b),
            Err(EngineError::InvalidRouting { .. })
        ));
    }

    #[test]
    fn bus_cycle_is_rejected() {
        let (mut p, config) = setup();
        let a = p.add_bus("A", &config).unwrap();
        let b = p.add_bus("B", &config).unwrap();
        p.connect(a.into(), b).unwrap();
        let err = p.connect(b.into(), a).unwrap_err();
        assert!(matches!(err, EngineError::Cycle(_)));
        assert_eq!(p.graph().output_of(b.into()), Some(BusId::MASTER));
    }

    #[test]
    fn removing_a_bus_reroutes_to_master() {
        let (mut p, config) = setup();
        let t = p.add_track("A", TrackKind::Audio, &config).unwrap();
        let b = p.add_bus("B", &config).unwrap();
        let fx = p.add_bus("FX", &config).unwrap();
        p.connect(t.into(), b).unwrap();
        p.set_send(t.into(), fx, -6.0, &config).unwrap();
        p.remove_bus(b).unwrap();
        assert_eq!(p.graph().output_of(t.into()), Some(BusId::MASTER));
        p.remove_bus(fx).unwrap();
        assert!(p.track(t).unwrap().strip.sends.is_empty());
        assert_eq!(p.graph().sends_of(t.into()).count(), 0);
    }

    #[test]
    fn solo_masks_without_touching_mute() {
        let (mut p, config) = setup();
        let ids: Vec<TrackId> = (0..3)
            .map(|i| p.add_track(format!("t{i}"), TrackKind::Audio, &config).unwrap())
            .collect();
        p.track_mut(ids[2]).unwrap().strip.mute = true;
        p.track_mut(ids[0]).unwrap().strip.solo = true;

        assert!(p.is_audible(ids[0].into()));
        assert!(!p.is_audible(ids[1].into()));
        assert!(!p.is_audible(ids[2].into()));

        p.track_mut(ids[0]).unwrap().strip.solo = false;
        assert!(p.is_audible(ids[1].into()));
        assert!(!p.is_audible(ids[2].into()));
        assert!(p.track(ids[2]).unwrap().strip.mute);
    }

    #[test]
    fn disconnected_tracks_fall_back_to_master() {
        let (mut p, config) = setup();
        let t = p.add_track("A", TrackKind::Audio, &config).unwrap();
        let b = p.add_bus("Drums", &config).unwrap();
        p.connect(t.into(), b).unwrap();

        assert!(p.disconnect(t.into(), b));
        assert_eq!(p.graph().output_of(t.into()), Some(BusId::MASTER));
        assert!(!p.disconnect(t.into(), BusId::MASTER));
        assert_eq!(p.graph().output_of(t.into()), Some(BusId::MASTER));

        // buses may be left unrouted
        assert!(p.disconnect(b.into(), BusId::MASTER));
        assert_eq!(p.graph().output_of(b.into()), None);
    }

    #[test]
    fn only_tracks_can_be_soloed() {
        let (mut p, config) = setup();
        let t = p.add_track("A", TrackKind::Audio, &config).unwrap();
        let b = p.add_bus("FX", &config).unwrap();
        assert!(matches!(p.set_solo(b.into(), true), Err(EngineError::BusSolo(id)) if id == b));
        assert!(matches!(
            p.set_solo(BusId::from_raw(99).into(), true),
            Err(EngineError::UnknownBus(_))
        ));
        assert!(!p.any_solo());
        p.set_solo(t.into(), true).unwrap();
        assert!(p.any_solo());
        assert!(p.is_audible(b.into()));
    }

    #[test]
    fn read_lane_with_points_locks_direct_writes() {
        let (mut p, config) = setup();
        let t = p.add_track("A", TrackKind::Audio, &config).unwrap();
        let fx = p.insert_effect(t.into(), EffectType::Delay, 0).unwrap();
        let target = ParamTarget::Effect {
            effect: fx,
            parameter: "feedback".into(),
        };
        let lane = p.create_lane(target.clone()).unwrap();
        assert_eq!(p.create_lane(target).unwrap(), lane);

        // an empty lane does not own the value
        assert_eq!(p.set_effect_parameter(fx, "feedback", 0.5).unwrap(), 0.5);

        p.lane_mut(lane).unwrap().insert_point(0, 0.2);
        let err = p.set_effect_parameter(fx, "feedback", 0.9).unwrap_err();
        assert!(matches!(err, EngineError::AutomationLock(AutomationLockError { lane: l, .. }) if l == lane));

        // writing modes hand the value back to the host
        let l = p.lane_mut(lane).unwrap();
        l.mode = AutomationMode::Write;
        l.begin_recording();
        assert_eq!(p.set_effect_parameter(fx, "feedback", 0.9).unwrap(), 0.9);
    }

    #[test]
    fn removing_an_effect_drops_its_lanes() {
        let (mut p, config) = setup();
        let t = p.add_track("A", TrackKind::Audio, &config).unwrap();
        let fx = p.insert_effect(t.into(), EffectType::Reverb, 0).unwrap();
        p.create_lane(ParamTarget::Effect {
            effect: fx,
            parameter: "decay".into(),
        })
        .unwrap();
        p.create_lane(ParamTarget::Volume { node: t.into() }).unwrap();
        p.remove_effect(fx).unwrap();
        assert_eq!(p.lanes().len(), 1);
        p.remove_track(t).unwrap();
        assert!(p.lanes().is_empty());
    }

    #[test]
    fn clips_and_notes_check_track_kind() {
        let (mut p, config) = setup();
        let audio = p.add_track("A", TrackKind::Audio, &config).unwrap();
        let midi = p.add_track("M", TrackKind::Midi, &config).unwrap();
        assert!(p.add_clip(audio, Clip::new(0, ClipAudio::mono(vec![0.0; 10]))).is_ok());
        assert!(matches!(
            p.add_clip(midi, Clip::new(0, ClipAudio::default())),
            Err(EngineError::WrongTrackKind { .. })
        ));
        assert!(p.add_note(midi, MidiNote::new(0, 100, 60, 100)).is_ok());
        assert!(p.add_note(audio, MidiNote::new(0, 100, 60, 100)).is_err());
        assert!(matches!(
            p.set_aux_input(audio, Some(BusId::MASTER)),
            Err(EngineError::WrongTrackKind { .. })
        ));
    }

    #[test]
    fn capacity_is_enforced() {
        let config = EngineConfig {
            max_nodes: 3,
            ..Default::default()
        };
        let mut p = Project::new("small", &config);
        p.add_track("a", TrackKind::Audio, &config).unwrap();
        p.add_bus("b", &config).unwrap();
        assert!(matches!(
            p.add_track("c", TrackKind::Audio, &config),
            Err(EngineError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn json_round_trip_rebuilds_bindings_and_ids() {
        let (mut p, config) = setup();
        let t = p.add_track("A", TrackKind::Audio, &config).unwrap();
        let b = p.add_bus("FX", &config).unwrap();
        p.set_send(t.into(), b, -3.0, &config).unwrap();
        let fx = p.insert_effect(b.into(), EffectType::Reverb, 0).unwrap();
        let lane = p.create_lane(ParamTarget::Pan { node: t.into() }).unwrap();
        p.lane_mut(lane).unwrap().insert_point(10, 0.5);

        let json = p.to_json().unwrap();
        let mut back = Project::from_json(&json).unwrap();
        assert_eq!(back.track(t).unwrap().strip.pan.lane, Some(lane));
        assert_eq!(back.graph().sends_of(t.into()).collect::<Vec<_>>(), vec![b]);
        assert!(back.effect(fx).is_some());
        let next = back.insert_effect(t.into(), EffectType::Eq, 0).unwrap();
        assert!(next.raw() > fx.raw());
        let next_track = back.add_track("B", TrackKind::Audio, &config).unwrap();
        assert!(next_track.raw() > t.raw());
    }

    #[test]
    fn cyclic_document_is_rejected() {
        let (mut p, config) = setup();
        let a = p.add_bus("A", &config).unwrap();
        let b = p.add_bus("B", &config).unwrap();
        p.connect(a.into(), b).unwrap();
        let json = p.to_json().unwrap();
        // rewrite B's output to point back at A
        let mut doc: serde_json::Value = serde_json::from_str(&json).unwrap();
        for edge in doc["graph"]["edges"].as_array_mut().unwrap() {
            if edge["from"]["id"] == b.raw() && edge["kind"] == "output" {
                edge["to"]["id"] = a.raw().into();
            }
        }
        let err = Project::from_json(&doc.to_string()).unwrap_err();
        assert!(matches!(err, EngineError::Cycle(_)));
    }

    #[test]
    fn midi_render_is_cached_until_notes_change() {
        let (mut p, config) = setup();
        let m = p.add_track("M", TrackKind::Midi, &config).unwrap();
        p.add_note(m, MidiNote::new(480, 4800, 60, 100)).unwrap();
        p.prepare_sources(48000.0);
        let first = rendered(&p, m).unwrap();
        p.prepare_sources(48000.0);
        assert!(Arc::ptr_eq(&first, &rendered(&p, m).unwrap()));
        assert!(p.content_end() > 480 + 4800);

        p.add_note(m, MidiNote::new(9600, 4800, 64, 100)).unwrap();
        assert!(rendered(&p, m).is_none());
    }
}
