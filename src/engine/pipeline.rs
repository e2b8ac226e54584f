//! The per-quantum render pipeline shared by real-time playback and offline
//! rendering.
//!
//! All buffers are allocated in [`Pipeline::new`]. [`Pipeline::render`] only
//! clears, mixes and processes within them.

use crate::config::EngineConfig;
use crate::dsp::buffer::StereoBuffer;
use crate::dsp::mixer::{db_to_gain, soft_clip, strip_gains};
use crate::effect::{MAX_PARAMS, apply_unit};
use crate::engine::kernel::KernelArena;
use crate::engine::snapshot::{ClipPlan, GraphSnapshot, Input};

pub struct Pipeline {
    buffers: Vec<StereoBuffer>,
    scratch: StereoBuffer,
    silence: StereoBuffer,
    pub kernels: KernelArena,
    quantum_frames: usize,
    soft_clip: bool,
}

impl Pipeline {
    pub fn new(config: &EngineConfig, kernels: KernelArena) -> Self {
        Self {
            buffers: (0..config.max_nodes)
                .map(|_| StereoBuffer::new(config.quantum_frames))
                .collect(),
            scratch: StereoBuffer::new(config.quantum_frames),
            silence: StereoBuffer::new(config.quantum_frames),
            kernels,
            quantum_frames: config.quantum_frames,
            soft_clip: config.master_soft_clip,
        }
    }

    pub fn quantum_frames(&self) -> usize {
        self.quantum_frames
    }

    /// Render `frames` (at most one quantum) starting at timeline `position`
    /// and return the master bus output.
    ///
    /// Clips only sound before `sources_until`; past it the graph keeps
    /// running on silence so effect tails ring out.
    pub fn render(&mut self, snapshot: &GraphSnapshot, position: u64, frames: usize, sources_until: u64) -> &StereoBuffer {
        let frames = frames.min(self.quantum_frames);
        let count = snapshot.nodes.len();
        if count == 0 || count > self.buffers.len() {
            self.silence.clear(frames);
            return &self.silence;
        }

        for buf in &mut self.buffers[..count] {
            buf.clear(frames);
        }

        let mut values = [0.0f64; MAX_PARAMS];
        for plan in &snapshot.nodes {
            let mut buf = std::mem::take(&mut self.buffers[plan.slot]);

            match &plan.input {
                Input::Mixed => {}
                Input::Clips(clips) => {
                    for clip in clips {
                        mix_clip(&mut buf, clip, position, sources_until);
                    }
                }
                Input::Tap(slot) => buf.mix_from(&self.buffers[*slot], 1.0, 1.0),
            }

            for fx in &plan.effects {
                // a kernel that has not arrived yet passes audio through
                let Some(processor) = self.kernels.get_mut(fx.kernel) else {
                    continue;
                };
                let n = fx.params.len().min(MAX_PARAMS);
                for (v, cell) in values.iter_mut().zip(&fx.params) {
                    *v = cell.get();
                }
                apply_unit(
                    processor,
                    fx.enabled,
                    fx.mix.get() as f32,
                    &values[..n],
                    &mut buf,
                    &mut self.scratch,
                );
            }

            let (gain_l, gain_r) = if plan.audible {
                strip_gains(plan.volume.get(), plan.pan.get())
            } else {
                (0.0, 0.0)
            };
            buf.apply_gain(gain_l, gain_r);
            let (peak_l, peak_r) = buf.peak();
            plan.meter.update(peak_l, peak_r);

            if let Some(out) = plan.output {
                self.buffers[out].mix_from(&buf, 1.0, 1.0);
            }
            for send in &plan.sends {
                let gain = db_to_gain(send.level.get()) as f32;
                if gain > 0.0 {
                    self.buffers[send.slot].mix_from(&buf, gain, gain);
                }
            }

            self.buffers[plan.slot] = buf;
        }

        let master = &mut self.buffers[snapshot.master_slot.min(count - 1)];
        if self.soft_clip {
            let (l, r) = master.channels_mut();
            for s in l.iter_mut().chain(r.iter_mut()) {
                *s = soft_clip(*s);
            }
        }
        master
    }
}

/// Add the part of `clip` that overlaps the block at `position`.
#[inline]
fn mix_clip(buf: &mut StereoBuffer, clip: &ClipPlan, position: u64, sources_until: u64) {
    let block_end = (position + buf.frames() as u64).min(sources_until);
    let start = clip.start.max(position);
    let end = clip.end().min(block_end);
    if start >= end {
        return;
    }
    let src = (start - clip.start) as usize;
    let dst = (start - position) as usize;
    let n = (end - start) as usize;
    let (l, r) = buf.channels_mut();
    let audio = &clip.audio;
    for (d, s) in l[dst..dst + n].iter_mut().zip(&audio.left[src..src + n]) {
        *d += s * clip.gain;
    }
    for (d, s) in r[dst..dst + n].iter_mut().zip(&audio.right[src..src + n]) {
        *d += s * clip.gain;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::kernel::KernelAllocator;
    use crate::project::{Clip, ClipAudio, Project};
    use crate::types::{BusId, NodeId, TrackKind};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn config() -> EngineConfig {
        EngineConfig {
            quantum_frames: 64,
            max_nodes: 8,
            ..Default::default()
        }
    }

    fn snapshot(p: &mut Project) -> GraphSnapshot {
        GraphSnapshot::build(p, &KernelAllocator::new(4), &mut HashMap::new(), 1, 48000.0)
    }

    fn pipeline(c: &EngineConfig) -> Pipeline {
        Pipeline::new(c, KernelArena::new(4))
    }

    #[test]
    fn clip_reaches_master_at_its_offset() {
        let c = config();
        let mut p = Project::new("p", &c);
        let t = p.add_track("T", TrackKind::Audio, &c).unwrap();
        p.add_clip(t, Clip::new(10, ClipAudio::mono(vec![0.5; 20]))).unwrap();
        let snap = snapshot(&mut p);
        let mut pipe = pipeline(&c);

        let out = pipe.render(&snap, 0, 64, u64::MAX);
        assert_eq!(out.left()[9], 0.0);
        assert!((out.left()[10] - 0.5).abs() < 1e-6);
        assert!((out.right()[29] - 0.5).abs() < 1e-6);
        assert_eq!(out.left()[30], 0.0);
    }

    #[test]
    fn sources_stop_at_the_limit() {
        let c = config();
        let mut p = Project::new("p", &c);
        let t = p.add_track("T", TrackKind::Audio, &c).unwrap();
        p.add_clip(t, Clip::new(0, ClipAudio::mono(vec![1.0; 64]))).unwrap();
        let snap = snapshot(&mut p);
        let out = pipeline(&c).render(&snap, 0, 64, 32).left().to_vec();
        assert!(out[..32].iter().all(|&s| s > 0.99));
        assert!(out[32..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn bus_sums_and_sends_add_a_copy() {
        let c = config();
        let mut p = Project::new("p", &c);
        let a = p.add_track("A", TrackKind::Audio, &c).unwrap();
        let b = p.add_track("B", TrackKind::Audio, &c).unwrap();
        let bus = p.add_bus("Sum", &c).unwrap();
        let fx = p.add_bus("Fx", &c).unwrap();
        p.connect(a.into(), bus).unwrap();
        p.connect(b.into(), bus).unwrap();
        p.set_send(a.into(), fx, 0.0, &c).unwrap();
        p.add_clip(a, Clip::new(0, ClipAudio::mono(vec![0.25; 64]))).unwrap();
        p.add_clip(b, Clip::new(0, ClipAudio::mono(vec![0.125; 64]))).unwrap();
        let snap = snapshot(&mut p);
        let mut pipe = pipeline(&c);

        let out = pipe.render(&snap, 0, 64, u64::MAX);
        // A via bus + B via bus + A via send
        assert!((out.left()[0] - 0.625).abs() < 1e-6);
        let (peak, _) = snap.node(bus.into()).unwrap().meter.take();
        assert!((peak - 0.375).abs() < 1e-6);
    }

    #[test]
    fn muted_and_unsoloed_tracks_are_silent() {
        let c = config();
        let mut p = Project::new("p", &c);
        let a = p.add_track("A", TrackKind::Audio, &c).unwrap();
        let b = p.add_track("B", TrackKind::Audio, &c).unwrap();
        p.add_clip(a, Clip::new(0, ClipAudio::mono(vec![0.5; 64]))).unwrap();
        p.add_clip(b, Clip::new(0, ClipAudio::mono(vec![0.25; 64]))).unwrap();

        p.track_mut(b).unwrap().strip.solo = true;
        let snap = snapshot(&mut p);
        let out = pipeline(&c).render(&snap, 0, 64, u64::MAX).left()[0];
        assert!((out - 0.25).abs() < 1e-6);

        p.track_mut(b).unwrap().strip.solo = false;
        p.track_mut(b).unwrap().strip.mute = true;
        let snap = snapshot(&mut p);
        let out = pipeline(&c).render(&snap, 0, 64, u64::MAX).left()[0];
        assert!((out - 0.5).abs() < 1e-6);
    }

    #[test]
    fn aux_track_taps_a_bus() {
        let c = config();
        let mut p = Project::new("p", &c);
        let src = p.add_track("src", TrackKind::Audio, &c).unwrap();
        let aux = p.add_track("aux", TrackKind::Aux, &c).unwrap();
        let tap = p.add_bus("tap", &c).unwrap();
        p.connect(src.into(), tap).unwrap();
        p.disconnect(tap.into(), BusId::MASTER);
        p.set_aux_input(aux, Some(tap)).unwrap();
        p.add_clip(src, Clip::new(0, ClipAudio::mono(vec![0.5; 64]))).unwrap();
        let snap = snapshot(&mut p);
        let out = pipeline(&c).render(&snap, 0, 64, u64::MAX).left()[0];
        assert!((out - 0.5).abs() < 1e-6, "only the aux path reaches master, got {out}");
    }

    #[test]
    fn automation_drives_volume_cells() {
        let c = config();
        let mut p = Project::new("p", &c);
        let t = p.add_track("T", TrackKind::Audio, &c).unwrap();
        p.add_clip(t, Clip::new(0, ClipAudio::mono(vec![1.0; 64]))).unwrap();
        let lane = p
            .create_lane(crate::automation::ParamTarget::Volume { node: NodeId::Track(t) })
            .unwrap();
        p.lane_mut(lane).unwrap().insert_point(0, -96.0);
        let snap = snapshot(&mut p).frozen();
        snap.read_automation(0);
        let out = pipeline(&c).render(&snap, 0, 64, u64::MAX).left()[0];
        assert_eq!(out, 0.0);
        assert!(Arc::strong_count(&snap.lanes[0].cell) >= 2);
    }
}
