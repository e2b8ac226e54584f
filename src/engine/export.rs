//! Mix export: mastering chain, normalisation and WAV encoding.

use crate::dsp::buffer::StereoBuffer;
use crate::dsp::mixer::{db_to_gain, rms};
use crate::effect::{ChainProcessor, EffectChain, EffectType, EffectUnit};
use crate::engine::offline::RenderedAudio;
use crate::error::{EngineError, FailureReason, OfflineRenderFailure, RenderStage};
use crate::types::EffectId;
use hound::{SampleFormat, WavSpec, WavWriter};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Int16,
    Int24,
    Float32,
}

impl ExportFormat {
    fn spec(self, sample_rate: u32) -> WavSpec {
        let (bits_per_sample, sample_format) = match self {
            ExportFormat::Int16 => (16, SampleFormat::Int),
            ExportFormat::Int24 => (24, SampleFormat::Int),
            ExportFormat::Float32 => (32, SampleFormat::Float),
        };
        WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample,
            sample_format,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Normalization {
    /// Scale so the loudest sample sits at `target_db` dBFS.
    Peak { target_db: f64 },
    /// Scale towards an RMS level, never pushing the peak above 0 dBFS.
    Rms { target_db: f64 },
}

/// One mastering stage as the host describes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectSpec {
    #[serde(rename = "type")]
    pub kind: EffectType,
    /// Overrides the type's default mix.
    #[serde(default)]
    pub mix: Option<f64>,
    #[serde(default)]
    pub params: Vec<(String, f64)>,
}

impl EffectSpec {
    pub fn new(kind: EffectType) -> Self {
        Self {
            kind,
            mix: None,
            params: Vec::new(),
        }
    }

    pub fn with_mix(mut self, mix: f64) -> Self {
        self.mix = Some(mix);
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.params.push((name.into(), value));
        self
    }

    /// Build a standalone chain. Stages get ids by position.
    pub fn build_chain(specs: &[EffectSpec]) -> Result<EffectChain, EngineError> {
        let mut chain = EffectChain::new();
        for (i, spec) in specs.iter().enumerate() {
            let id = EffectId::from_raw(i as u32 + 1);
            let mut unit = EffectUnit::new(id, spec.kind);
            if let Some(mix) = spec.mix {
                unit.mix.set(mix);
            }
            for (name, value) in &spec.params {
                let param = unit.param_mut(name).ok_or_else(|| EngineError::UnknownParameter {
                    effect: id,
                    name: name.clone(),
                })?;
                param.set(*value);
            }
            chain.insert(unit, i);
        }
        Ok(chain)
    }
}

/// Run `audio` through `chain` in blocks of `block_frames`.
pub fn master(audio: &mut RenderedAudio, chain: &EffectChain, block_frames: usize) {
    let block_frames = block_frames.max(1);
    let mut processor = ChainProcessor::new(chain, audio.sample_rate, block_frames);
    let mut block = StereoBuffer::new(block_frames);
    let frames = audio.frames();
    let mut start = 0;
    while start < frames {
        let n = block_frames.min(frames - start);
        block.clear(n);
        {
            let (l, r) = block.channels_mut();
            l.copy_from_slice(&audio.left[start..start + n]);
            r.copy_from_slice(&audio.right[start..start + n]);
        }
        processor.process(&mut block);
        audio.left[start..start + n].copy_from_slice(block.left());
        audio.right[start..start + n].copy_from_slice(block.right());
        start += n;
    }
}

/// Apply `normalization` in place. Returns the gain used.
pub fn normalize(audio: &mut RenderedAudio, normalization: Normalization) -> f32 {
    let peak = audio.peak() as f64;
    if peak <= 0.0 {
        return 1.0;
    }
    let gain = match normalization {
        Normalization::Peak { target_db } => db_to_gain(target_db.min(0.0)) / peak,
        Normalization::Rms { target_db } => {
            let level = rms(&audio.left, &audio.right);
            (db_to_gain(target_db.min(0.0)) / level).min(1.0 / peak)
        }
    } as f32;
    for s in audio.left.iter_mut().chain(audio.right.iter_mut()) {
        *s *= gain;
    }
    gain
}

/// Encode as a stereo WAV file in memory.
pub fn encode_wav(audio: &RenderedAudio, format: ExportFormat) -> Result<Vec<u8>, OfflineRenderFailure> {
    let fail = |e: hound::Error| OfflineRenderFailure::new(RenderStage::Encode, audio.region, FailureReason::Encode(e.to_string()));
    let spec = format.spec(audio.sample_rate.round() as u32);
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec).map_err(fail)?;
        for (&l, &r) in audio.left.iter().zip(&audio.right) {
            for s in [l, r] {
                match format {
                    ExportFormat::Int16 => writer.write_sample(quantize(s, i16::MAX as f32) as i16),
                    ExportFormat::Int24 => writer.write_sample(quantize(s, 8_388_607.0)),
                    ExportFormat::Float32 => writer.write_sample(s),
                }
                .map_err(fail)?;
            }
        }
        writer.finalize().map_err(fail)?;
    }
    Ok(cursor.into_inner())
}

#[inline]
fn quantize(sample: f32, full_scale: f32) -> i32 {
    (sample.clamp(-1.0, 1.0) * full_scale).round() as i32
}
