//! The audio-callback side of the engine.
//!
//! ```text
//! ┌────────────┐  KernelCommand   ┌───────────────────┐
//! │   Engine   │ ───────────────► │ RealtimeProcessor │
//! │ (control)  │ ◄─────────────── │  (audio callback) │
//! └────────────┘  retired kernels └───────────────────┘
//!       ▲          RecordedPoint            │
//!       └────────── RtEvent ────────────────┘
//! ```
//!
//! Every queue is an `rtrb` SPSC ring buffer, so neither side ever blocks.
//! Snapshots arrive through `ArcSwap`. After each quantum the processor
//! reports the generation it finished with in [`RealtimeStatus`]; the engine
//! holds every superseded snapshot until a newer generation is reported, so
//! the last reference is never dropped here.

use crate::config::EngineConfig;
use crate::effect::Processor;
use crate::engine::events::{RecordedPoint, RtEvent};
use crate::engine::kernel::{KernelArena, KernelCommand};
use crate::engine::pipeline::Pipeline;
use crate::engine::snapshot::GraphSnapshot;
use crate::transport::Transport;
use arc_swap::ArcSwap;
use rtrb::{Consumer, Producer};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters the audio thread publishes for the control side.
#[derive(Debug, Default)]
pub struct RealtimeStatus {
    pub dropouts: AtomicU64,
    /// Generation of the last snapshot a finished quantum used.
    pub finished_generation: AtomicU64,
    /// Recorded automation points lost to a full queue.
    pub lost_points: AtomicU64,
    pub lost_events: AtomicU64,
}

pub struct RealtimeProcessor {
    snapshot: Arc<ArcSwap<GraphSnapshot>>,
    transport: Arc<Transport>,
    kernel_rx: Consumer<KernelCommand>,
    retired_tx: Producer<Box<Processor>>,
    record_tx: Producer<RecordedPoint>,
    events_tx: Producer<RtEvent>,
    pipeline: Pipeline,
    status: Arc<RealtimeStatus>,
    sample_rate: f64,
}

/// Control-side ends of the queues a [`RealtimeProcessor`] talks through.
pub struct RealtimeLinks {
    pub kernel_tx: Producer<KernelCommand>,
    pub retired_rx: Consumer<Box<Processor>>,
    pub record_rx: Consumer<RecordedPoint>,
    pub events_rx: Consumer<RtEvent>,
}

impl RealtimeProcessor {
    pub fn new(
        config: &EngineConfig,
        snapshot: Arc<ArcSwap<GraphSnapshot>>,
        transport: Arc<Transport>,
        status: Arc<RealtimeStatus>,
    ) -> (Self, RealtimeLinks) {
        let kernel_slots = config.max_effects * 2 + 16;
        let (kernel_tx, kernel_rx) = rtrb::RingBuffer::new(kernel_slots);
        let (retired_tx, retired_rx) = rtrb::RingBuffer::new(kernel_slots);
        let (record_tx, record_rx) = rtrb::RingBuffer::new(config.record_queue_capacity);
        let (events_tx, events_rx) = rtrb::RingBuffer::new(config.event_queue_capacity);

        let processor = Self {
            snapshot,
            transport,
            kernel_rx,
            retired_tx,
            record_tx,
            events_tx,
            pipeline: Pipeline::new(config, KernelArena::new(config.max_effects)),
            status,
            sample_rate: config.sample_rate,
        };
        let links = RealtimeLinks {
            kernel_tx,
            retired_rx,
            record_rx,
            events_rx,
        };
        (processor, links)
    }

    /// Fill `out` (interleaved stereo) with the next frames of the mix.
    ///
    /// Work is split into quanta; each quantum picks up the latest snapshot,
    /// transport requests and kernel changes at its start.
    pub fn process(&mut self, out: &mut [f32]) {
        let quantum = self.pipeline.quantum_frames();
        let usable = out.len() / 2 * 2;
        let (frames, rest) = out.split_at_mut(usable);
        rest.fill(0.0);
        for chunk in frames.chunks_mut(quantum * 2) {
            self.process_quantum(chunk);
        }
    }

    fn process_quantum(&mut self, out: &mut [f32]) {
        let started = Instant::now();
        let frames = out.len() / 2;

        self.drain_kernel_commands();
        let snapshot = self.snapshot.load();

        match self.transport.begin_quantum(frames) {
            Some(plan) => {
                for seg in plan.segments() {
                    self.run_automation(&snapshot, seg.position);
                    let mix = self.pipeline.render(&snapshot, seg.position, seg.frames, u64::MAX);
                    write_interleaved(mix.left(), mix.right(), &mut out[seg.offset * 2..]);
                }
                if plan.wrapped {
                    let position = plan.loop_start().unwrap_or_default();
                    self.send_event(RtEvent::LoopWrapped { position });
                }
            }
            None => {
                // stopped or paused: no sources, but tails keep ringing
                let mix = self.pipeline.render(&snapshot, self.transport.position(), frames, 0);
                write_interleaved(mix.left(), mix.right(), out);
            }
        }
        let generation = snapshot.generation;
        drop(snapshot);
        self.status.finished_generation.store(generation, Ordering::Release);

        let budget = frames as f64 / self.sample_rate;
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed > budget {
            self.status.dropouts.fetch_add(1, Ordering::Relaxed);
            self.send_event(RtEvent::Dropout {
                position: self.transport.position(),
                late_micros: ((elapsed - budget) * 1e6) as u64,
            });
        }
    }

    fn send_event(&mut self, event: RtEvent) {
        if self.events_tx.push(event).is_err() {
            self.status.lost_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Lanes that are writing capture the live value; the rest drive theirs.
    fn run_automation(&mut self, snapshot: &GraphSnapshot, position: u64) {
        for lane in &snapshot.lanes {
            if lane.flags.is_writing(lane.mode) {
                let point = RecordedPoint {
                    lane: lane.id,
                    time: position,
                    value: lane.cell.get(),
                };
                if self.record_tx.push(point).is_err() {
                    self.status.lost_points.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        snapshot.read_automation(position);
    }

    pub fn drain_kernel_commands(&mut self) {
        while let Ok(command) = self.kernel_rx.pop() {
            self.apply_kernel(command);
        }
    }

    fn apply_kernel(&mut self, command: KernelCommand) {
        let displaced = match command {
            KernelCommand::Install(at, processor) => self.pipeline.kernels.install(at, processor),
            KernelCommand::Retire(at) => self.pipeline.kernels.remove(at),
        };
        if let Some(old) = displaced {
            // A full queue means the control side stopped draining. Dropping
            // here is the only option left.
            let _ = self.retired_tx.push(old);
        }
    }

    pub fn live_kernels(&self) -> usize {
        self.pipeline.kernels.live()
    }
}

#[inline]
fn write_interleaved(left: &[f32], right: &[f32], out: &mut [f32]) {
    for ((frame, l), r) in out.chunks_exact_mut(2).zip(left).zip(right) {
        frame[0] = *l;
        frame[1] = *r;
    }
}
