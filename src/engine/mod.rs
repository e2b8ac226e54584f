//! The engine: the host-facing command/query API.
//!
//! [`Engine`] lives on the control thread and owns the [`Project`]. Every
//! structural command edits the project, rebuilds a [`GraphSnapshot`] and
//! publishes it; parameter writes go straight into shared atomic cells. The
//! audio callback runs a [`RealtimeProcessor`] taken from the engine once.

pub mod events;
pub mod export;
pub mod kernel;
pub mod meter;
pub mod offline;
pub mod pipeline;
pub mod realtime;
pub mod snapshot;

use crate::automation::{AutomationMode, ParamTarget};
use crate::config::EngineConfig;
use crate::effect::{EffectType, Processor};
use crate::error::{EngineError, OfflineRenderFailure, Result};
use crate::project::{Clip, Humanize, MidiNote, Project};
use crate::transport::{PlayState, Transport};
use crate::types::{BusId, EffectId, LaneId, NodeId, Region, TimeSignature, TrackId, TrackKind};
use arc_swap::ArcSwap;
use events::{EngineEvent, EventQueue, RecordedPoint, RtEvent};
use export::{EffectSpec, ExportFormat, Normalization};
use kernel::{KernelAllocator, KernelCommand};
use log::{debug, info, warn};
use meter::{Latency, Meter};
use offline::{PreparedRender, RenderJob, RenderTask, RenderedAudio};
use realtime::{RealtimeLinks, RealtimeProcessor, RealtimeStatus};
use snapshot::GraphSnapshot;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Retained snapshots past this count mean the audio callback has stalled.
const RETAINED_WARNING: usize = 64;

pub struct Engine {
    config: EngineConfig,
    project: Project,
    transport: Arc<Transport>,
    snapshot: Arc<ArcSwap<GraphSnapshot>>,
    generation: u64,
    /// Superseded snapshots the audio thread may still be reading.
    retained: VecDeque<Arc<GraphSnapshot>>,
    kernels: KernelAllocator,
    links: RealtimeLinks,
    /// Until the host takes it, kernel commands are applied here directly.
    realtime: Option<RealtimeProcessor>,
    events: EventQueue,
    meters: HashMap<NodeId, Arc<Meter>>,
    status: Arc<RealtimeStatus>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let config = config.sanitized();
        let project = Project::new("Untitled", &config);
        let transport = Arc::new(Transport::new(config.sample_rate, &project.transport));
        let snapshot = Arc::new(ArcSwap::from_pointee(GraphSnapshot::default()));
        let status = Arc::new(RealtimeStatus::default());
        let (realtime, links) = RealtimeProcessor::new(
            &config,
            Arc::clone(&snapshot),
            Arc::clone(&transport),
            Arc::clone(&status),
        );

        let mut engine = Self {
            kernels: KernelAllocator::new(config.max_effects),
            config,
            project,
            transport,
            snapshot,
            generation: 0,
            retained: VecDeque::new(),
            links,
            realtime: Some(realtime),
            events: EventQueue::default(),
            meters: HashMap::new(),
            status,
        };
        engine.publish();
        info!(
            "engine started: {} Hz, {} frame quanta",
            engine.config.sample_rate, engine.config.quantum_frames
        );
        engine
    }

    /// Stop playback and release every buffer.
    pub fn shutdown(self) {
        self.transport.stop();
        info!("engine shut down after {} dropouts", self.dropout_count());
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Hand the audio-callback half to the host. Only the first call returns it.
    pub fn take_realtime(&mut self) -> Option<RealtimeProcessor> {
        self.realtime.take()
    }

    // ── publication ────────────────────────────────────────────────────────

    fn publish(&mut self) {
        self.project.prepare_sources(self.config.sample_rate);
        self.sync_kernels();
        self.generation += 1;
        let snapshot = GraphSnapshot::build(
            &mut self.project,
            &self.kernels,
            &mut self.meters,
            self.generation,
            self.config.sample_rate,
        );
        let project = &self.project;
        self.meters.retain(|node, _| project.contains(*node));

        let previous = self.snapshot.swap(Arc::new(snapshot));
        self.retained.push_back(previous);
        if self.retained.len() == RETAINED_WARNING {
            warn!("{RETAINED_WARNING} snapshots waiting on the audio callback");
        }
        self.release_snapshots();
        self.collect_retired();
        debug!("published graph generation {}", self.generation);
    }

    /// Give every effect in the project a kernel and retire the rest.
    fn sync_kernels(&mut self) {
        let wanted: Vec<(EffectId, EffectType)> = self
            .project
            .strips()
            .flat_map(|(_, s)| s.chain.iter().map(|u| (u.id, u.kind)))
            .collect();

        for id in self.kernels.effects() {
            if wanted.iter().all(|(w, _)| *w != id) {
                if let Some(at) = self.kernels.release(id) {
                    self.send_kernel(KernelCommand::Retire(at));
                }
            }
        }
        for (id, kind) in wanted {
            if self.kernels.get(id).is_some() {
                continue;
            }
            match self.kernels.allocate(id) {
                Some(at) => {
                    let processor = Box::new(Processor::new(kind, self.config.sample_rate));
                    self.send_kernel(KernelCommand::Install(at, processor));
                }
                None => warn!("kernel arena full, {id} passes audio through"),
            }
        }
    }

    fn send_kernel(&mut self, command: KernelCommand) {
        if let Err(rtrb::PushError::Full(_)) = self.links.kernel_tx.push(command) {
            warn!("kernel queue full, the audio thread is not draining it");
        }
        if let Some(rt) = self.realtime.as_mut() {
            rt.drain_kernel_commands();
        }
    }

    /// Drop superseded snapshots the audio thread can no longer be reading.
    ///
    /// It loads the newest snapshot each quantum, so once it reports a
    /// generation every older one is out of its hands.
    fn release_snapshots(&mut self) {
        let audio_thread_live = self.realtime.is_none() && Arc::strong_count(&self.status) > 1;
        if !audio_thread_live {
            self.retained.clear();
            return;
        }
        let finished = self.status.finished_generation.load(Ordering::Acquire);
        while self.retained.front().is_some_and(|s| s.generation < finished) {
            self.retained.pop_front();
        }
    }

    fn collect_retired(&mut self) {
        let mut count = 0;
        while self.links.retired_rx.pop().is_ok() {
            count += 1;
        }
        if count > 0 {
            debug!("freed {count} retired kernels");
        }
    }

    /// Merge recorded automation and forward real-time events.
    fn collect_realtime(&mut self) {
        let mut recorded: BTreeMap<LaneId, Vec<RecordedPoint>> = BTreeMap::new();
        while let Ok(point) = self.links.record_rx.pop() {
            recorded.entry(point.lane).or_default().push(point);
        }
        let mut changed = false;
        for (id, points) in recorded {
            let Ok(lane) = self.project.lane_mut(id) else {
                continue;
            };
            let kept = points.iter().filter(|p| lane.record_point(p.time, p.value)).count();
            if kept > 0 {
                changed = true;
                self.events.push(EngineEvent::AutomationRecorded { lane: id, points: kept });
            }
        }

        while let Ok(event) = self.links.events_rx.pop() {
            match event {
                RtEvent::Dropout { position, late_micros } => {
                    warn!("dropout at sample {position}, {late_micros} µs late");
                    self.events.push(EngineEvent::Dropout { position, late_micros });
                }
                RtEvent::LoopWrapped { position } => self.events.push(EngineEvent::LoopWrapped { position }),
            }
        }
        let lost = self.status.lost_points.swap(0, Ordering::AcqRel);
        if lost > 0 {
            warn!("automation queue full, {lost} recorded points lost");
            self.events.push(EngineEvent::AutomationOverflow { points: lost });
        }
        let lost = self.status.lost_events.swap(0, Ordering::AcqRel);
        if lost > 0 {
            warn!("real-time event queue full, {lost} events lost");
        }
        self.release_snapshots();

        if changed {
            self.publish();
        }
    }

    fn structural<T>(&mut self, result: Result<T>, event: impl FnOnce(&T) -> EngineEvent) -> Result<T> {
        match result {
            Ok(value) => {
                self.publish();
                self.events.push(event(&value));
                Ok(value)
            }
            Err(e) => {
                warn!("rejected: {e}");
                Err(e)
            }
        }
    }

    // ── structure ──────────────────────────────────────────────────────────

    pub fn add_track(&mut self, name: impl Into<String>, kind: TrackKind) -> Result<TrackId> {
        let result = self.project.add_track(name, kind, &self.config);
        self.structural(result, |id| EngineEvent::TrackAdded(*id))
    }

    pub fn remove_track(&mut self, id: TrackId) -> Result<()> {
        let result = self.project.remove_track(id).map(drop);
        self.structural(result, |_| EngineEvent::TrackRemoved(id))
    }

    pub fn add_bus(&mut self, name: impl Into<String>) -> Result<BusId> {
        let result = self.project.add_bus(name, &self.config);
        self.structural(result, |id| EngineEvent::BusAdded(*id))
    }

    pub fn remove_bus(&mut self, id: BusId) -> Result<()> {
        let result = self.project.remove_bus(id).map(drop);
        self.structural(result, |_| EngineEvent::BusRemoved(id))
    }

    pub fn connect(&mut self, from: NodeId, to: BusId) -> Result<()> {
        let result = self.project.connect(from, to);
        self.structural(result, |_| EngineEvent::RoutingChanged)
    }

    /// No-op when the edge does not exist. A track disconnected from a bus
    /// goes back to the master bus.
    pub fn disconnect(&mut self, from: NodeId, to: BusId) {
        if self.project.disconnect(from, to) {
            self.publish();
            self.events.push(EngineEvent::RoutingChanged);
        }
    }

    pub fn set_aux_input(&mut self, track: TrackId, bus: Option<BusId>) -> Result<()> {
        let result = self.project.set_aux_input(track, bus);
        self.structural(result, |_| EngineEvent::RoutingChanged)
    }

    pub fn insert_effect(&mut self, owner: NodeId, kind: EffectType, index: usize) -> Result<EffectId> {
        let result = if self.project.effect_count() >= self.config.max_effects {
            Err(EngineError::CapacityExceeded {
                what: "effect",
                limit: self.config.max_effects,
            })
        } else {
            self.project.insert_effect(owner, kind, index)
        };
        self.structural(result, |&effect| EngineEvent::EffectInserted { owner, effect, kind })
    }

    pub fn remove_effect(&mut self, id: EffectId) -> Result<()> {
        let result = self.project.remove_effect(id).map(drop);
        self.structural(result, |_| EngineEvent::EffectRemoved(id))
    }

    pub fn reorder_effect(&mut self, id: EffectId, new_index: usize) -> Result<()> {
        let result = self.project.reorder_effect(id, new_index);
        self.structural(result, |_| EngineEvent::RoutingChanged)
    }

    pub fn set_effect_enabled(&mut self, id: EffectId, enabled: bool) -> Result<()> {
        self.project.effect_mut(id)?.enabled = enabled;
        self.publish();
        Ok(())
    }

    /// Returns the stored (clamped) mix.
    pub fn set_effect_mix(&mut self, id: EffectId, mix: f64) -> Result<f64> {
        self.set_parameter(id, "mix", mix)
    }

    // ── content ────────────────────────────────────────────────────────────

    pub fn add_clip(&mut self, track: TrackId, clip: Clip) -> Result<()> {
        let result = self.project.add_clip(track, clip);
        self.structural(result, |_| EngineEvent::ClipsChanged(track))
    }

    pub fn clear_clips(&mut self, track: TrackId) -> Result<()> {
        let result = self.project.track_mut(track).map(|t| t.clips.clear());
        self.structural(result, |_| EngineEvent::ClipsChanged(track))
    }

    pub fn add_note(&mut self, track: TrackId, note: MidiNote) -> Result<()> {
        let result = self.project.add_note(track, note);
        self.structural(result, |_| EngineEvent::NotesChanged(track))
    }

    pub fn clear_notes(&mut self, track: TrackId) -> Result<()> {
        let result = self.project.track_mut(track).map(|t| {
            t.notes.clear();
            t.invalidate_render();
        });
        self.structural(result, |_| EngineEvent::NotesChanged(track))
    }

    pub fn set_humanize(&mut self, track: TrackId, humanize: Option<Humanize>) -> Result<()> {
        let result = self.project.track_mut(track).map(|t| {
            t.humanize = humanize;
            t.invalidate_render();
        });
        self.structural(result, |_| EngineEvent::NotesChanged(track))
    }

    /// Reseed humanisation. Every MIDI track is rendered again.
    pub fn set_seed(&mut self, seed: u64) {
        self.project.set_seed(seed);
        self.publish();
    }

    // ── parameters ─────────────────────────────────────────────────────────
    //
    // Values land in shared cells; nothing is republished.

    /// Returns the stored (clamped) value.
    pub fn set_parameter(&mut self, effect: EffectId, name: &str, value: f64) -> Result<f64> {
        self.project.set_effect_parameter(effect, name, value)
    }

    pub fn set_volume(&mut self, node: NodeId, db: f64) -> Result<f64> {
        self.project.set_target(&ParamTarget::Volume { node }, db)
    }

    pub fn set_pan(&mut self, node: NodeId, pan: f64) -> Result<f64> {
        self.project.set_target(&ParamTarget::Pan { node }, pan)
    }

    pub fn set_mute(&mut self, node: NodeId, mute: bool) -> Result<()> {
        self.project.strip_mut(node)?.mute = mute;
        self.publish();
        Ok(())
    }

    /// Solo a track. Buses cannot be soloed.
    pub fn set_solo(&mut self, node: NodeId, solo: bool) -> Result<()> {
        if let Err(e) = self.project.set_solo(node, solo) {
            warn!("rejected: {e}");
            return Err(e);
        }
        self.publish();
        Ok(())
    }

    pub fn set_armed(&mut self, track: TrackId, armed: bool) -> Result<()> {
        self.project.track_mut(track)?.strip.armed = armed;
        Ok(())
    }

    /// Create or update a send. Returns the stored level.
    pub fn set_send(&mut self, node: NodeId, bus: BusId, level_db: f64) -> Result<f64> {
        let existed = self.project.strip(node).is_some_and(|s| s.send(bus).is_some());
        let result = self.project.set_send(node, bus, level_db, &self.config);
        if existed {
            return result;
        }
        self.structural(result, |_| EngineEvent::RoutingChanged)
    }

    pub fn remove_send(&mut self, node: NodeId, bus: BusId) -> Result<bool> {
        let result = self.project.remove_send(node, bus);
        self.structural(result, |_| EngineEvent::RoutingChanged)
    }

    // ── automation ─────────────────────────────────────────────────────────

    pub fn create_lane(&mut self, target: ParamTarget) -> Result<LaneId> {
        let lane = self.project.create_lane(target)?;
        self.publish();
        Ok(lane)
    }

    pub fn remove_lane(&mut self, id: LaneId) -> Result<()> {
        self.collect_realtime();
        self.project.remove_lane(id)?;
        self.publish();
        Ok(())
    }

    pub fn set_lane_mode(&mut self, id: LaneId, mode: AutomationMode) -> Result<()> {
        self.project.lane_mut(id)?.mode = mode;
        self.publish();
        Ok(())
    }

    pub fn start_automation_recording(&mut self, id: LaneId, mode: AutomationMode) -> Result<()> {
        self.collect_realtime();
        let lane = self.project.lane_mut(id)?;
        lane.mode = mode;
        lane.begin_recording();
        debug!("recording {id} in {mode:?} mode");
        self.publish();
        Ok(())
    }

    pub fn stop_automation_recording(&mut self, id: LaneId) -> Result<()> {
        self.collect_realtime();
        let position = self.transport.position();
        self.project.lane_mut(id)?.end_recording(position);
        self.publish();
        Ok(())
    }

    /// Record a point from the host. While the lane is recording, points
    /// behind the transport are ignored. Returns whether the point was kept.
    pub fn record_point(&mut self, id: LaneId, time: u64, value: f64) -> Result<bool> {
        self.collect_realtime();
        let position = self.transport.position();
        let lane = self.project.lane_mut(id)?;
        if lane.is_recording() && time < position {
            return Ok(false);
        }
        let kept = lane.record_point(time, value);
        if kept {
            self.publish();
        }
        Ok(kept)
    }

    /// Offline edit. Returns the stored value.
    pub fn insert_point(&mut self, id: LaneId, time: u64, value: f64) -> Result<f64> {
        let value = self.project.lane_mut(id)?.insert_point(time, value);
        self.publish();
        Ok(value)
    }

    pub fn clear_lane(&mut self, id: LaneId) -> Result<()> {
        self.project.lane_mut(id)?.clear();
        self.publish();
        Ok(())
    }

    pub fn touch_begin(&mut self, id: LaneId) -> Result<()> {
        self.project.lane_mut(id)?.touch_begin();
        Ok(())
    }

    pub fn touch_end(&mut self, id: LaneId) -> Result<()> {
        self.collect_realtime();
        let position = self.transport.position();
        self.project.lane_mut(id)?.touch_end(position);
        self.publish();
        Ok(())
    }

    // ── transport ──────────────────────────────────────────────────────────

    fn transport_changed(&self) {
        self.events.push(EngineEvent::TransportChanged {
            playing: self.transport.is_playing(),
            position: self.transport.position(),
        });
    }

    pub fn play(&mut self) {
        self.transport.play();
        self.transport_changed();
    }

    /// Halt, return to where playback started and release latched lanes.
    pub fn stop(&mut self) {
        self.collect_realtime();
        let was = self.transport.state();
        let reached = self.transport.stop();
        if was != PlayState::Stopped {
            for lane in self.project.lanes_mut() {
                lane.release_latch(reached);
            }
            self.publish();
        }
        self.transport_changed();
    }

    pub fn pause(&mut self) {
        self.transport.pause();
        self.transport_changed();
    }

    pub fn seek(&mut self, position: u64) {
        self.transport.seek(position);
        self.transport_changed();
    }

    pub fn set_loop(&mut self, start: u64, end: u64, enabled: bool) {
        self.transport.set_loop(start, end, enabled);
        let (start, end, enabled) = self.transport.loop_region();
        let settings = &mut self.project.transport;
        settings.loop_start = start;
        settings.loop_end = end;
        settings.loop_enabled = enabled;
    }

    /// Returns the stored (clamped) tempo.
    pub fn set_tempo(&mut self, bpm: f64) -> f64 {
        let bpm = self.transport.set_tempo(bpm);
        self.project.transport.bpm = bpm;
        bpm
    }

    pub fn set_time_signature(&mut self, ts: TimeSignature) {
        self.transport.set_time_signature(ts);
        self.project.transport.time_signature = self.transport.time_signature();
    }

    pub fn set_recording(&mut self, recording: bool) {
        self.transport.set_recording(recording);
    }

    // ── rendering ──────────────────────────────────────────────────────────

    /// From the start of the project to the end of its last clip or note.
    pub fn project_region(&self) -> Region {
        Region::new(0, self.project.content_end())
    }

    fn prepare(&mut self, job: &RenderJob) -> Result<PreparedRender, OfflineRenderFailure> {
        self.collect_realtime();
        let snapshot = self.snapshot.load_full();
        PreparedRender::new(&snapshot, &self.config, job, self.project.tail_seconds())
    }

    /// Render `[start, start + duration)` plus a tail of at least
    /// `tail_seconds` and long enough for every effect to decay.
    pub fn render_offline(
        &mut self,
        start: u64,
        duration: u64,
        tail_seconds: f64,
    ) -> Result<RenderedAudio, OfflineRenderFailure> {
        self.render_job(&RenderJob::new(Region::new(start, duration), tail_seconds))
    }

    /// Render on the calling thread.
    pub fn render_job(&mut self, job: &RenderJob) -> Result<RenderedAudio, OfflineRenderFailure> {
        let render = self.prepare(job)?;
        let result = render.run(&AtomicBool::new(false), |_| {});
        self.events.push(EngineEvent::RenderFinished {
            region: job.region,
            ok: result.is_ok(),
        });
        result
    }

    /// Render on a background thread. The live graph keeps playing.
    pub fn spawn_render(&mut self, job: &RenderJob) -> Result<RenderTask, OfflineRenderFailure> {
        let render = self.prepare(job)?;
        RenderTask::spawn(render, self.events.clone())
    }

    /// Render the whole project, master it, normalise it and encode it.
    pub fn export_mix(
        &mut self,
        format: ExportFormat,
        normalization: Option<Normalization>,
        mastering: Option<&[EffectSpec]>,
    ) -> Result<Vec<u8>> {
        let chain = mastering.map(EffectSpec::build_chain).transpose()?;
        let mut audio = self.render_job(&RenderJob::new(self.project_region(), 0.0))?;
        if let Some(chain) = &chain {
            export::master(&mut audio, chain, self.config.quantum_frames);
        }
        if let Some(normalization) = normalization {
            let gain = export::normalize(&mut audio, normalization);
            debug!("normalised with gain {gain}");
        }
        let bytes = export::encode_wav(&audio, format)?;
        info!("exported {} frames as {format:?}, {} bytes", audio.frames(), bytes.len());
        Ok(bytes)
    }

    // ── observability ──────────────────────────────────────────────────────

    pub fn latency(&self) -> Latency {
        Latency {
            quantum_frames: self.config.quantum_frames,
            processing_frames: self.snapshot.load().latency_frames,
            sample_rate: self.config.sample_rate,
        }
    }

    pub fn dropout_count(&self) -> u64 {
        self.status.dropouts.load(Ordering::Relaxed)
    }

    /// Peak since the previous read, `(left, right)`.
    pub fn peak_meter(&self, node: NodeId) -> Option<(f32, f32)> {
        self.meters.get(&node).map(|m| m.take())
    }

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        self.collect_realtime();
        self.events.drain()
    }

    // ── persistence ────────────────────────────────────────────────────────

    pub fn save_project(&mut self) -> Result<String> {
        self.collect_realtime();
        self.project.to_json()
    }

    /// Replace the project. Playback stops; the current project is kept if
    /// the document is rejected.
    pub fn load_project(&mut self, json: &str) -> Result<()> {
        let project = Project::from_json(json)?;
        if project.node_count() > self.config.max_nodes {
            return Err(EngineError::CapacityExceeded {
                what: "node",
                limit: self.config.max_nodes,
            });
        }
        if project.effect_count() > self.config.max_effects {
            return Err(EngineError::CapacityExceeded {
                what: "effect",
                limit: self.config.max_effects,
            });
        }

        self.collect_realtime();
        self.transport.stop();
        self.transport.seek(0);
        self.transport.apply_settings(&project.transport);
        info!(
            "loaded project '{}': {} tracks, {} buses",
            project.name,
            project.tracks().len(),
            project.buses().len()
        );
        self.project = project;
        // effect ids from the old project may collide with the new one
        for id in self.kernels.effects() {
            if let Some(at) = self.kernels.release(id) {
                self.send_kernel(KernelCommand::Retire(at));
            }
        }
        self.meters.clear();
        self.publish();
        self.events.push(EngineEvent::ProjectLoaded);
        Ok(())
    }
}
