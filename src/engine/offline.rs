//! Offline rendering: the real-time pipeline run as fast as possible over a
//! frozen snapshot, with a post-roll tail.
//!
//! Each render builds fresh kernels, so two renders of an unchanged project are
//! bit-identical. Renders can run on the caller's thread or on a background
//! thread through [`RenderTask`].

use crate::config::EngineConfig;
use crate::dsp::mixer::{gain_to_db, rms};
use crate::engine::events::{EngineEvent, EventQueue};
use crate::engine::kernel::KernelArena;
use crate::engine::pipeline::Pipeline;
use crate::engine::snapshot::GraphSnapshot;
use crate::error::{FailureReason, OfflineRenderFailure, RenderStage};
use crate::types::{Region, seconds_to_frames};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

/// How the requested tail is combined with the effects' own tails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TailMode {
    /// Long enough for the slowest effect to die away, and never shorter
    /// than requested.
    #[default]
    Auto,
    /// Exactly the requested tail.
    Exact,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderJob {
    pub region: Region,
    pub tail_seconds: f64,
    pub tail_mode: TailMode,
}

impl RenderJob {
    pub fn new(region: Region, tail_seconds: f64) -> Self {
        Self {
            region,
            tail_seconds,
            tail_mode: TailMode::Auto,
        }
    }

    pub fn exact(mut self) -> Self {
        self.tail_mode = TailMode::Exact;
        self
    }

    /// Tail length in seconds given the longest effect tail in the project.
    pub fn resolve_tail(&self, effect_tail: f64, margin: f64) -> f64 {
        let requested = if self.tail_seconds.is_finite() {
            self.tail_seconds.max(0.0)
        } else {
            0.0
        };
        match self.tail_mode {
            TailMode::Exact => requested,
            TailMode::Auto => requested.max(effect_tail + margin),
        }
    }
}

/// Output of a finished render. Always complete; failures never produce one.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedAudio {
    pub sample_rate: f64,
    pub region: Region,
    pub tail_frames: u64,
    pub left: Vec<f32>,
    pub right: Vec<f32>,
}

impl RenderedAudio {
    pub fn frames(&self) -> usize {
        self.left.len()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.frames() as f64 / self.sample_rate
    }

    pub fn peak(&self) -> f32 {
        self.left
            .iter()
            .chain(&self.right)
            .fold(0.0f32, |m, s| m.max(s.abs()))
    }

    /// RMS in dBFS over `[start, end)` seconds, clamped to the buffer.
    pub fn rms_window_db(&self, start: f64, end: f64) -> f64 {
        let to_frame = |s: f64| ((s * self.sample_rate).round().max(0.0) as usize).min(self.frames());
        let (a, b) = (to_frame(start), to_frame(end));
        if a >= b {
            return gain_to_db(0.0);
        }
        gain_to_db(rms(&self.left[a..b], &self.right[a..b]))
    }

    /// SHA-256 over the little-endian sample bits, left channel first.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for s in self.left.iter().chain(&self.right) {
            hasher.update(s.to_bits().to_le_bytes());
        }
        hasher.finalize().into()
    }

    pub fn fingerprint_hex(&self) -> String {
        self.fingerprint().iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn interleaved(&self) -> Vec<f32> {
        self.left
            .iter()
            .zip(&self.right)
            .flat_map(|(l, r)| [*l, *r])
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderProgress {
    pub rendered_frames: u64,
    pub total_frames: u64,
}

impl RenderProgress {
    pub fn fraction(&self) -> f64 {
        if self.total_frames == 0 {
            1.0
        } else {
            self.rendered_frames as f64 / self.total_frames as f64
        }
    }
}

/// Everything a render needs, detached from the engine.
#[derive(Debug, Clone)]
pub struct PreparedRender {
    pub(crate) snapshot: GraphSnapshot,
    pub(crate) config: EngineConfig,
    pub(crate) region: Region,
    pub(crate) tail_frames: u64,
}

impl PreparedRender {
    /// Freeze `snapshot` for `job`. Fails when the total length is above
    /// `max_offline_seconds`.
    pub fn new(
        snapshot: &GraphSnapshot,
        config: &EngineConfig,
        job: &RenderJob,
        effect_tail: f64,
    ) -> Result<Self, OfflineRenderFailure> {
        let tail = job.resolve_tail(effect_tail, config.tail_margin_seconds);
        let tail_frames = seconds_to_frames(tail, config.sample_rate);
        let total = job.region.frames.saturating_add(tail_frames);
        let limit = seconds_to_frames(config.max_offline_seconds, config.sample_rate);
        if total > limit {
            return Err(OfflineRenderFailure::new(
                RenderStage::Allocate,
                job.region,
                FailureReason::TooLong { frames: total, limit },
            ));
        }
        Ok(Self {
            snapshot: snapshot.frozen(),
            config: config.clone(),
            region: job.region,
            tail_frames,
        })
    }

    pub fn total_frames(&self) -> u64 {
        self.region.frames + self.tail_frames
    }

    /// Run the pipeline to the end of the tail.
    ///
    /// `cancel` is checked between quanta. `on_progress` is called roughly
    /// every tenth of a second of rendered audio.
    pub fn run(
        self,
        cancel: &AtomicBool,
        mut on_progress: impl FnMut(RenderProgress),
    ) -> Result<RenderedAudio, OfflineRenderFailure> {
        let region = self.region;
        let fail = |stage, reason| OfflineRenderFailure::new(stage, region, reason);
        let total = self.total_frames();

        let capacity = usize::try_from(total).map_err(|_| fail(RenderStage::Allocate, FailureReason::OutOfMemory))?;
        let mut left: Vec<f32> = Vec::new();
        let mut right: Vec<f32> = Vec::new();
        left.try_reserve_exact(capacity)
            .and_then(|_| right.try_reserve_exact(capacity))
            .map_err(|_| fail(RenderStage::Allocate, FailureReason::OutOfMemory))?;

        let sr = self.config.sample_rate;
        let kernels = KernelArena::for_snapshot(&self.snapshot, sr, self.config.max_effects);
        let mut pipeline = Pipeline::new(&self.config, kernels);
        let quantum = pipeline.quantum_frames() as u64;
        let report_every = seconds_to_frames(0.1, sr).max(quantum);

        let sources_until = region.end();
        let end = region.start + total;
        let mut position = region.start;
        let mut since_report = 0;
        while position < end {
            if cancel.load(Ordering::Relaxed) {
                return Err(fail(RenderStage::Process, FailureReason::Cancelled));
            }
            let frames = quantum.min(end - position);
            self.snapshot.read_automation(position);
            let mix = pipeline.render(&self.snapshot, position, frames as usize, sources_until);
            left.extend_from_slice(mix.left());
            right.extend_from_slice(mix.right());
            position += frames;

            since_report += frames;
            if since_report >= report_every {
                since_report = 0;
                on_progress(RenderProgress {
                    rendered_frames: position - region.start,
                    total_frames: total,
                });
            }
        }
        on_progress(RenderProgress {
            rendered_frames: total,
            total_frames: total,
        });

        Ok(RenderedAudio {
            sample_rate: sr,
            region,
            tail_frames: self.tail_frames,
            left,
            right,
        })
    }
}

/// A render running on its own thread.
pub struct RenderTask {
    cancel: Arc<AtomicBool>,
    progress: Receiver<RenderProgress>,
    handle: JoinHandle<Result<RenderedAudio, OfflineRenderFailure>>,
    region: Region,
}

impl RenderTask {
    /// Start `render` on a background thread. `RenderFinished` is posted to
    /// `events` when it ends.
    pub fn spawn(render: PreparedRender, events: EventQueue) -> Result<Self, OfflineRenderFailure> {
        let region = render.region;
        let cancel = Arc::new(AtomicBool::new(false));
        let (progress_tx, progress): (Sender<RenderProgress>, _) = mpsc::channel();
        let flag = Arc::clone(&cancel);

        let handle = thread::Builder::new()
            .name("mixdown-render".into())
            .spawn(move || {
                log::debug!("offline render of {region} started");
                let result = render.run(&flag, |p| {
                    let _ = progress_tx.send(p);
                });
                match &result {
                    Ok(audio) => log::info!("offline render of {region} finished, {} frames", audio.frames()),
                    Err(e) => log::warn!("{e}"),
                }
                events.push(EngineEvent::RenderFinished {
                    region,
                    ok: result.is_ok(),
                });
                result
            })
            .map_err(|_| OfflineRenderFailure::new(RenderStage::Allocate, region, FailureReason::OutOfMemory))?;

        Ok(Self {
            cancel,
            progress,
            handle,
            region,
        })
    }

    pub fn region(&self) -> Region {
        self.region
    }

    /// Ask the render to stop at the next quantum boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Latest progress report, if any arrived since the last poll.
    pub fn poll_progress(&self) -> Option<RenderProgress> {
        self.progress.try_iter().last()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the render. A panic on the render thread is re-raised here.
    pub fn join(self) -> Result<RenderedAudio, OfflineRenderFailure> {
        match self.handle.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
