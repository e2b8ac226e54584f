//! Immutable processing plans published to the real-time side.
//!
//! A [`GraphSnapshot`] is everything one quantum needs: nodes in processing
//! order with their buffer slots, effect kernel references, gain cells,
//! routing targets and automation lanes. Structural commands build a new one
//! and swap it in; parameter writes go straight through the shared cells.

use crate::automation::{AutomationMode, AutomationPoint, LaneFlags, interpolate};
use crate::effect::EffectType;
use crate::engine::kernel::{KernelAllocator, KernelRef};
use crate::engine::meter::Meter;
use crate::parameter::ParamCell;
use crate::project::{ClipAudio, Project};
use crate::types::{BusId, EffectId, LaneId, NodeId, TrackKind};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ClipPlan {
    pub start: u64,
    pub gain: f32,
    pub audio: Arc<ClipAudio>,
}

impl ClipPlan {
    pub fn end(&self) -> u64 {
        self.start + self.audio.frames() as u64
    }
}

/// Where a node's signal comes from before its chain.
#[derive(Debug, Clone)]
pub enum Input {
    /// Buses: only what other nodes mix in.
    Mixed,
    Clips(Vec<ClipPlan>),
    /// Aux track listening to the post-fader output of the bus in this slot.
    Tap(usize),
}

#[derive(Debug, Clone)]
pub struct EffectPlan {
    pub id: EffectId,
    pub kind: EffectType,
    pub kernel: KernelRef,
    pub enabled: bool,
    pub mix: Arc<ParamCell>,
    pub params: Vec<Arc<ParamCell>>,
}

#[derive(Debug, Clone)]
pub struct SendPlan {
    pub slot: usize,
    /// Level in dB.
    pub level: Arc<ParamCell>,
}

#[derive(Debug, Clone)]
pub struct NodePlan {
    pub node: NodeId,
    pub slot: usize,
    pub input: Input,
    pub effects: Vec<EffectPlan>,
    pub volume: Arc<ParamCell>,
    pub pan: Arc<ParamCell>,
    /// After mute and solo.
    pub audible: bool,
    pub output: Option<usize>,
    pub sends: Vec<SendPlan>,
    pub meter: Arc<Meter>,
}

#[derive(Debug, Clone)]
pub struct LanePlan {
    pub id: LaneId,
    pub mode: AutomationMode,
    pub flags: Arc<LaneFlags>,
    pub points: Arc<[AutomationPoint]>,
    pub min: f64,
    pub max: f64,
    /// The parameter this lane drives or records.
    pub cell: Arc<ParamCell>,
}

#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    pub generation: u64,
    /// Processing order. `nodes[i].slot == i`.
    pub nodes: Vec<NodePlan>,
    pub master_slot: usize,
    pub lanes: Vec<LanePlan>,
    /// Worst lookahead on any path into the master bus.
    pub latency_frames: usize,
}

impl GraphSnapshot {
    /// Plan the project as it stands. Effects without a kernel slot are left out.
    pub fn build(
        project: &mut Project,
        kernels: &KernelAllocator,
        meters: &mut HashMap<NodeId, Arc<Meter>>,
        generation: u64,
        sample_rate: f64,
    ) -> Self {
        let order = project.processing_order();
        let slot_of: HashMap<NodeId, usize> = order.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        let project = &*project;
        let graph = project.graph();
        let bus_slot = |bus: BusId| slot_of.get(&NodeId::Bus(bus)).copied();

        let mut nodes = Vec::with_capacity(order.len());
        let mut latency_in = vec![0usize; order.len()];
        let mut master_latency = 0;

        for (slot, &node) in order.iter().enumerate() {
            let Some(strip) = project.strip(node) else {
                continue;
            };
            let input = match node.as_track().and_then(|id| project.track(id)) {
                Some(track) if track.kind == TrackKind::Aux => graph
                    .aux_input_of(track.id)
                    .and_then(bus_slot)
                    .map_or(Input::Mixed, Input::Tap),
                Some(track) => Input::Clips(
                    track
                        .sources()
                        .map(|c| ClipPlan {
                            start: c.start,
                            gain: c.gain(),
                            audio: Arc::clone(&c.audio),
                        })
                        .collect(),
                ),
                None => Input::Mixed,
            };

            let effects: Vec<EffectPlan> = strip
                .chain
                .iter()
                .filter_map(|unit| {
                    Some(EffectPlan {
                        id: unit.id,
                        kind: unit.kind,
                        kernel: kernels.get(unit.id)?,
                        enabled: unit.enabled,
                        mix: unit.mix.cell(),
                        params: unit.cells(),
                    })
                })
                .collect();

            let output = graph.output_of(node).and_then(bus_slot);
            let sends: Vec<SendPlan> = strip
                .sends
                .iter()
                .filter_map(|s| {
                    Some(SendPlan {
                        slot: bus_slot(s.bus)?,
                        level: s.level.cell(),
                    })
                })
                .collect();

            let own = latency_in[slot] + strip.chain.latency_frames(sample_rate);
            for edge in graph.edges().iter().filter(|e| e.from == node) {
                if let Some(&t) = slot_of.get(&edge.to) {
                    latency_in[t] = latency_in[t].max(own);
                }
            }
            if node == NodeId::Bus(BusId::MASTER) {
                master_latency = own;
            }

            nodes.push(NodePlan {
                node,
                slot,
                input,
                effects,
                volume: strip.volume.cell(),
                pan: strip.pan.cell(),
                audible: project.is_audible(node),
                output,
                sends,
                meter: Arc::clone(meters.entry(node).or_default()),
            });
        }

        let lanes = project
            .lanes()
            .iter()
            .filter_map(|lane| {
                let param = project.parameter(&lane.target)?;
                Some(LanePlan {
                    id: lane.id,
                    mode: lane.mode,
                    flags: lane.flags(),
                    points: Arc::from(lane.points()),
                    min: lane.min,
                    max: lane.max,
                    cell: param.cell(),
                })
            })
            .collect();

        Self {
            generation,
            master_slot: bus_slot(BusId::MASTER).unwrap_or(0),
            nodes,
            lanes,
            latency_frames: master_latency,
        }
    }

    pub fn node(&self, node: NodeId) -> Option<&NodePlan> {
        self.nodes.iter().find(|n| n.node == node)
    }

    /// A copy with its own parameter cells and meters, detached from the
    /// live model. Offline renders run on these so that automation playback
    /// never writes into values the host or the real-time side can see.
    pub fn frozen(&self) -> Self {
        let mut forked: HashMap<*const ParamCell, Arc<ParamCell>> = HashMap::new();
        let mut fork = |cell: &Arc<ParamCell>| {
            Arc::clone(
                forked
                    .entry(Arc::as_ptr(cell))
                    .or_insert_with(|| Arc::new(ParamCell::new(cell.get()))),
            )
        };

        let mut copy = self.clone();
        for node in &mut copy.nodes {
            node.volume = fork(&node.volume);
            node.pan = fork(&node.pan);
            node.meter = Arc::default();
            for send in &mut node.sends {
                send.level = fork(&send.level);
            }
            for fx in &mut node.effects {
                fx.mix = fork(&fx.mix);
                for p in &mut fx.params {
                    *p = fork(p);
                }
            }
        }
        for lane in &mut copy.lanes {
            lane.cell = fork(&lane.cell);
            lane.flags = Arc::default();
        }
        copy
    }

    /// Drive every lane that has points from its curve at `position`.
    /// Lanes that are writing are skipped.
    pub fn read_automation(&self, position: u64) {
        for lane in &self.lanes {
            if lane.flags.is_writing(lane.mode) {
                continue;
            }
            if let Some(value) = interpolate(&lane.points, position, lane.min, lane.max) {
                lane.cell.set(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::ParamTarget;
    use crate::config::EngineConfig;
    use crate::effect::EffectType;

    fn build(project: &mut Project, kernels: &KernelAllocator) -> GraphSnapshot {
        GraphSnapshot::build(project, kernels, &mut HashMap::new(), 1, 48000.0)
    }

    #[test]
    fn plans_follow_processing_order() {
        let config = EngineConfig::default();
        let mut p = Project::new("p", &config);
        let bus = p.add_bus("B", &config).unwrap();
        let t = p.add_track("T", TrackKind::Audio, &config).unwrap();
        p.connect(t.into(), bus).unwrap();
        let snap = build(&mut p, &KernelAllocator::new(4));

        assert_eq!(snap.nodes.len(), 3);
        for (i, n) in snap.nodes.iter().enumerate() {
            assert_eq!(n.slot, i);
            if let Some(out) = n.output {
                assert!(out > i, "outputs point forward in the order");
            }
        }
        assert_eq!(snap.nodes[snap.master_slot].node, NodeId::Bus(BusId::MASTER));
    }

    #[test]
    fn effects_need_a_kernel_slot() {
        let config = EngineConfig::default();
        let mut p = Project::new("p", &config);
        let t = p.add_track("T", TrackKind::Audio, &config).unwrap();
        let a = p.insert_effect(t.into(), EffectType::Eq, 0).unwrap();
        p.insert_effect(t.into(), EffectType::Delay, 1).unwrap();
        let mut kernels = KernelAllocator::new(4);
        kernels.allocate(a);
        let snap = build(&mut p, &kernels);
        let plan = snap.node(t.into()).unwrap();
        assert_eq!(plan.effects.len(), 1);
        assert_eq!(plan.effects[0].id, a);
    }

    #[test]
    fn latency_follows_the_worst_path() {
        let config = EngineConfig::default();
        let mut p = Project::new("p", &config);
        let t = p.add_track("T", TrackKind::Audio, &config).unwrap();
        let fx = p.insert_effect(t.into(), EffectType::Limiter, 0).unwrap();
        let mut kernels = KernelAllocator::new(4);
        kernels.allocate(fx);
        let snap = build(&mut p, &kernels);
        assert_eq!(
            snap.latency_frames,
            EffectType::Limiter.latency_frames(48000.0)
        );
    }

    #[test]
    fn frozen_copy_has_its_own_cells() {
        let config = EngineConfig::default();
        let mut p = Project::new("p", &config);
        let t = p.add_track("T", TrackKind::Audio, &config).unwrap();
        let lane = p.create_lane(ParamTarget::Volume { node: t.into() }).unwrap();
        p.lane_mut(lane).unwrap().insert_point(0, -12.0);
        let snap = build(&mut p, &KernelAllocator::new(4));
        let frozen = snap.frozen();

        frozen.read_automation(0);
        let plan = frozen.node(t.into()).unwrap();
        assert_eq!(plan.volume.get(), -12.0);
        assert!(Arc::ptr_eq(&plan.volume, &frozen.lanes[0].cell));
        // the live model is untouched
        assert_eq!(p.track(t).unwrap().strip.volume.value(), 0.0);
    }
}
