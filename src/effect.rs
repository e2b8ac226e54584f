//! Effect units and chains.
//!
//! [`EffectType`] is the closed set of processors. [`Processor`] holds the
//! DSP state of one unit and dispatches with a `match`, so the real-time path
//! never goes through a vtable. [`EffectUnit`] and [`EffectChain`] are the
//! control-side model: ids, enable flags, dry/wet and parameters.

use crate::dsp::buffer::StereoBuffer;
use crate::dsp::chorus::Chorus;
use crate::dsp::compressor::Compressor;
use crate::dsp::delay::{Delay, MAX_DELAY_SECONDS};
use crate::dsp::distortion::Distortion;
use crate::dsp::eq::Equalizer;
use crate::dsp::filter::FilterEffect;
use crate::dsp::gate::Gate;
use crate::dsp::limiter::Limiter;
use crate::dsp::phaser::Phaser;
use crate::dsp::reverb::Reverb;
use crate::error::{AutomationLockError, EngineError, Result};
use crate::parameter::{ParamCell, ParamSpec, Parameter};
use crate::types::EffectId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Most parameters any processor exposes.
pub const MAX_PARAMS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectType {
    Eq,
    Compressor,
    Reverb,
    Delay,
    Limiter,
    Gate,
    Distortion,
    Chorus,
    Phaser,
    Filter,
}

impl EffectType {
    pub const ALL: [EffectType; 10] = [
        EffectType::Eq,
        EffectType::Compressor,
        EffectType::Reverb,
        EffectType::Delay,
        EffectType::Limiter,
        EffectType::Gate,
        EffectType::Distortion,
        EffectType::Chorus,
        EffectType::Phaser,
        EffectType::Filter,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EffectType::Eq => "eq",
            EffectType::Compressor => "compressor",
            EffectType::Reverb => "reverb",
            EffectType::Delay => "delay",
            EffectType::Limiter => "limiter",
            EffectType::Gate => "gate",
            EffectType::Distortion => "distortion",
            EffectType::Chorus => "chorus",
            EffectType::Phaser => "phaser",
            EffectType::Filter => "filter",
        }
    }

    pub fn param_specs(self) -> &'static [ParamSpec] {
        match self {
            EffectType::Eq => Equalizer::PARAMS,
            EffectType::Compressor => Compressor::PARAMS,
            EffectType::Reverb => Reverb::PARAMS,
            EffectType::Delay => Delay::PARAMS,
            EffectType::Limiter => Limiter::PARAMS,
            EffectType::Gate => Gate::PARAMS,
            EffectType::Distortion => Distortion::PARAMS,
            EffectType::Chorus => Chorus::PARAMS,
            EffectType::Phaser => Phaser::PARAMS,
            EffectType::Filter => FilterEffect::PARAMS,
        }
    }

    /// Seconds of output that may follow silent input, for the given parameter values.
    pub fn tail_seconds(self, values: &[f64]) -> f64 {
        match self {
            EffectType::Eq | EffectType::Compressor | EffectType::Distortion => 0.0,
            EffectType::Reverb => Reverb::tail_seconds(values),
            EffectType::Delay => Delay::tail_seconds(values),
            EffectType::Limiter => Limiter::tail_seconds(values),
            EffectType::Gate => Gate::tail_seconds(values),
            EffectType::Chorus => Chorus::tail_seconds(values),
            EffectType::Phaser => Phaser::tail_seconds(values),
            EffectType::Filter => FilterEffect::tail_seconds(values),
        }
    }

    /// Reverb and delay add their wet path on top of the dry signal instead
    /// of replacing it; `mix` is then the wet level.
    pub fn is_parallel(self) -> bool {
        matches!(self, EffectType::Reverb | EffectType::Delay)
    }

    /// Mix a freshly inserted unit starts with.
    pub fn default_mix(self) -> f64 {
        match self {
            EffectType::Reverb | EffectType::Delay => 0.35,
            EffectType::Chorus | EffectType::Phaser => 0.5,
            _ => 1.0,
        }
    }

    /// Processing delay the unit adds to its wet path.
    pub fn latency_frames(self, sample_rate: f64) -> usize {
        match self {
            EffectType::Limiter => Limiter::lookahead_frames(sample_rate),
            _ => 0,
        }
    }
}

/// DSP state for one effect unit.
#[derive(Debug, Clone)]
pub enum Processor {
    Eq(Equalizer),
    Compressor(Compressor),
    Reverb(Reverb),
    Delay(Delay),
    Limiter(Limiter),
    Gate(Gate),
    Distortion(Distortion),
    Chorus(Chorus),
    Phaser(Phaser),
    Filter(FilterEffect),
}

impl Processor {
    /// Allocates delay lines and filter state. Never call from the real-time path.
    pub fn new(kind: EffectType, sample_rate: f64) -> Self {
        match kind {
            EffectType::Eq => Processor::Eq(Equalizer::new(sample_rate)),
            EffectType::Compressor => Processor::Compressor(Compressor::new(sample_rate)),
            EffectType::Reverb => Processor::Reverb(Reverb::new(sample_rate)),
            EffectType::Delay => Processor::Delay(Delay::new(sample_rate, MAX_DELAY_SECONDS)),
            EffectType::Limiter => Processor::Limiter(Limiter::new(sample_rate)),
            EffectType::Gate => Processor::Gate(Gate::new(sample_rate)),
            EffectType::Distortion => Processor::Distortion(Distortion::new(sample_rate)),
            EffectType::Chorus => Processor::Chorus(Chorus::new(sample_rate)),
            EffectType::Phaser => Processor::Phaser(Phaser::new(sample_rate)),
            EffectType::Filter => Processor::Filter(FilterEffect::new(sample_rate)),
        }
    }

    pub fn kind(&self) -> EffectType {
        match self {
            Processor::Eq(_) => EffectType::Eq,
            Processor::Compressor(_) => EffectType::Compressor,
            Processor::Reverb(_) => EffectType::Reverb,
            Processor::Delay(_) => EffectType::Delay,
            Processor::Limiter(_) => EffectType::Limiter,
            Processor::Gate(_) => EffectType::Gate,
            Processor::Distortion(_) => EffectType::Distortion,
            Processor::Chorus(_) => EffectType::Chorus,
            Processor::Phaser(_) => EffectType::Phaser,
            Processor::Filter(_) => EffectType::Filter,
        }
    }

    pub fn set_params(&mut self, values: &[f64]) {
        match self {
            Processor::Eq(p) => p.set_params(values),
            Processor::Compressor(p) => p.set_params(values),
            Processor::Reverb(p) => p.set_params(values),
            Processor::Delay(p) => p.set_params(values),
            Processor::Limiter(p) => p.set_params(values),
            Processor::Gate(p) => p.set_params(values),
            Processor::Distortion(p) => p.set_params(values),
            Processor::Chorus(p) => p.set_params(values),
            Processor::Phaser(p) => p.set_params(values),
            Processor::Filter(p) => p.set_params(values),
        }
    }

    /// Replace the block with the unit's wet signal.
    #[inline]
    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        match self {
            Processor::Eq(p) => p.process_block(left, right),
            Processor::Compressor(p) => p.process_block(left, right),
            Processor::Reverb(p) => p.process_block(left, right),
            Processor::Delay(p) => p.process_block(left, right),
            Processor::Limiter(p) => p.process_block(left, right),
            Processor::Gate(p) => p.process_block(left, right),
            Processor::Distortion(p) => p.process_block(left, right),
            Processor::Chorus(p) => p.process_block(left, right),
            Processor::Phaser(p) => p.process_block(left, right),
            Processor::Filter(p) => p.process_block(left, right),
        }
    }

    pub fn reset(&mut self) {
        match self {
            Processor::Eq(p) => p.reset(),
            Processor::Compressor(p) => p.reset(),
            Processor::Reverb(p) => p.clear(),
            Processor::Delay(p) => p.clear(),
            Processor::Limiter(p) => p.reset(),
            Processor::Gate(p) => p.reset(),
            Processor::Distortion(p) => p.reset(),
            Processor::Chorus(p) => p.clear(),
            Processor::Phaser(p) => p.reset(),
            Processor::Filter(p) => p.reset(),
        }
    }
}

/// Blend a processed block back over the dry signal held in `dry`.
///
/// `wet` holds the unit's output on entry and the mix on return:
/// `out = dry * (1 - mix) + wet * mix`.
#[inline]
pub fn blend_dry_wet(wet: &mut StereoBuffer, dry: &StereoBuffer, mix: f32) {
    if mix >= 1.0 {
        return;
    }
    let dry_gain = 1.0 - mix;
    let (wl, wr) = wet.channels_mut();
    for (w, d) in wl.iter_mut().zip(dry.left()) {
        *w = d * dry_gain + *w * mix;
    }
    for (w, d) in wr.iter_mut().zip(dry.right()) {
        *w = d * dry_gain + *w * mix;
    }
}

/// Add `level` times the wet block on top of the dry signal held in `dry`.
#[inline]
pub fn sum_dry_wet(wet: &mut StereoBuffer, dry: &StereoBuffer, level: f32) {
    let (wl, wr) = wet.channels_mut();
    for (w, d) in wl.iter_mut().zip(dry.left()) {
        *w = d + *w * level;
    }
    for (w, d) in wr.iter_mut().zip(dry.right()) {
        *w = d + *w * level;
    }
}

/// Run one unit over `buf` in place. `scratch` receives a copy of the dry input.
///
/// Disabled units and a zero mix leave `buf` untouched. Parallel types keep
/// the full dry signal at any mix.
#[inline]
pub fn apply_unit(
    processor: &mut Processor,
    enabled: bool,
    mix: f32,
    values: &[f64],
    buf: &mut StereoBuffer,
    scratch: &mut StereoBuffer,
) {
    if !enabled {
        return;
    }
    processor.set_params(values);
    scratch.copy_from(buf);
    {
        let (l, r) = buf.channels_mut();
        processor.process_block(l, r);
    }
    let mix = mix.clamp(0.0, 1.0);
    if processor.kind().is_parallel() {
        sum_dry_wet(buf, scratch, mix);
    } else {
        blend_dry_wet(buf, scratch, mix);
    }
}

/// One processor in a chain, as the host sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectUnit {
    pub id: EffectId,
    #[serde(rename = "type")]
    pub kind: EffectType,
    pub enabled: bool,
    /// Dry/wet balance in `[0, 1]`, or the wet level for parallel types.
    pub mix: Parameter,
    /// Parameters in the processor's table order.
    pub params: Vec<Parameter>,
}

impl EffectUnit {
    pub fn new(id: EffectId, kind: EffectType) -> Self {
        Self {
            id,
            kind,
            enabled: true,
            mix: Parameter::new("mix", 0.0, 1.0, kind.default_mix(), ""),
            params: kind.param_specs().iter().map(Parameter::from_spec).collect(),
        }
    }

    pub fn param(&self, name: &str) -> Option<&Parameter> {
        if name == "mix" {
            return Some(&self.mix);
        }
        self.params.iter().find(|p| p.name == name)
    }

    pub fn param_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        if name == "mix" {
            return Some(&mut self.mix);
        }
        self.params.iter_mut().find(|p| p.name == name)
    }

    /// Current values in table order.
    pub fn values(&self) -> Vec<f64> {
        self.params.iter().map(Parameter::value).collect()
    }

    pub fn tail_seconds(&self) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        self.kind.tail_seconds(&self.values())
    }

    /// Shared value cells, in table order.
    pub fn cells(&self) -> Vec<Arc<ParamCell>> {
        self.params.iter().map(Parameter::cell).collect()
    }

    /// Bring a deserialized unit in line with its processor's table:
    /// unknown parameters are dropped, missing ones added at their defaults.
    pub(crate) fn normalize(&mut self) {
        let mut ordered = Vec::with_capacity(self.kind.param_specs().len());
        for spec in self.kind.param_specs() {
            let mut param = Parameter::from_spec(spec);
            if let Some(saved) = self.params.iter().find(|p| p.name == spec.name) {
                param.set(saved.value());
                param.lane = saved.lane;
            }
            ordered.push(param);
        }
        self.params = ordered;
        self.mix.normalize();
    }

    /// Give every parameter its own value cell.
    pub(crate) fn detach(&mut self) {
        self.mix.detach();
        for p in &mut self.params {
            p.detach();
        }
    }
}

/// An ordered list of effect units.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EffectChain {
    units: Vec<EffectUnit>,
}

impl EffectChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> &[EffectUnit] {
        &self.units
    }

    pub(crate) fn units_mut(&mut self) -> &mut [EffectUnit] {
        &mut self.units
    }

    pub fn iter(&self) -> impl Iterator<Item = &EffectUnit> {
        self.units.iter()
    }

    pub fn position(&self, id: EffectId) -> Option<usize> {
        self.units.iter().position(|u| u.id == id)
    }

    pub fn get(&self, id: EffectId) -> Option<&EffectUnit> {
        self.units.iter().find(|u| u.id == id)
    }

    pub fn get_mut(&mut self, id: EffectId) -> Option<&mut EffectUnit> {
        self.units.iter_mut().find(|u| u.id == id)
    }

    /// Insert at `index`, clamped to the end of the chain.
    pub fn insert(&mut self, unit: EffectUnit, index: usize) -> usize {
        let index = index.min(self.units.len());
        self.units.insert(index, unit);
        index
    }

    /// Remove a unit. This is the unit's destruction point.
    pub fn remove(&mut self, id: EffectId) -> Option<EffectUnit> {
        let index = self.position(id)?;
        Some(self.units.remove(index))
    }

    /// Move a unit to `new_index` (clamped). Returns false if the id is unknown.
    pub fn reorder(&mut self, id: EffectId, new_index: usize) -> bool {
        let Some(from) = self.position(id) else {
            return false;
        };
        let unit = self.units.remove(from);
        let to = new_index.min(self.units.len());
        self.units.insert(to, unit);
        true
    }

    /// Clamp and store a parameter value. `is_locked` reports whether a lane owns the value.
    pub fn set_parameter(
        &self,
        id: EffectId,
        name: &str,
        value: f64,
        is_locked: impl Fn(&Parameter) -> Option<AutomationLockError>,
    ) -> Result<f64> {
        let unit = self.get(id).ok_or(EngineError::UnknownEffect(id))?;
        let param = unit.param(name).ok_or_else(|| EngineError::UnknownParameter {
            effect: id,
            name: name.to_string(),
        })?;
        if let Some(err) = is_locked(param) {
            return Err(err.into());
        }
        Ok(param.set(value))
    }

    /// Longest tail across enabled units.
    pub fn tail_seconds(&self) -> f64 {
        self.units.iter().map(EffectUnit::tail_seconds).fold(0.0, f64::max)
    }

    /// Summed latency of enabled units.
    pub fn latency_frames(&self, sample_rate: f64) -> usize {
        self.units
            .iter()
            .filter(|u| u.enabled)
            .map(|u| u.kind.latency_frames(sample_rate))
            .sum()
    }
}

/// A self-contained chain with its own processors, used for mastering.
///
/// Unlike the engine's chains this one owns its DSP state directly and is
/// meant for offline use only.
#[derive(Debug, Clone)]
pub struct ChainProcessor {
    stages: Vec<(Processor, f32, Vec<f64>)>,
    scratch: StereoBuffer,
}

impl ChainProcessor {
    pub fn new(chain: &EffectChain, sample_rate: f64, max_frames: usize) -> Self {
        let stages = chain
            .iter()
            .filter(|u| u.enabled)
            .map(|u| {
                (
                    Processor::new(u.kind, sample_rate),
                    u.mix.value() as f32,
                    u.values(),
                )
            })
            .collect();
        Self {
            stages,
            scratch: StereoBuffer::new(max_frames),
        }
    }

    pub fn process(&mut self, buf: &mut StereoBuffer) {
        for (processor, mix, values) in &mut self.stages {
            apply_unit(processor, true, *mix, values, buf, &mut self.scratch);
        }
    }
}
