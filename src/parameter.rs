//! Bounded, named parameters with lock-free value cells.
//!
//! The control model and every published snapshot share the same
//! [`ParamCell`], so a host write is visible to the real-time context on its
//! next quantum without republishing anything.

use crate::types::LaneId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Static description of one processor parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub min: f64,
    pub max: f64,
    pub default: f64,
    pub unit: &'static str,
}

impl ParamSpec {
    pub const fn new(name: &'static str, min: f64, max: f64, default: f64, unit: &'static str) -> Self {
        Self {
            name,
            min,
            max,
            default,
            unit,
        }
    }
}

/// Read value `index` from a processor's value slice, falling back to the spec default.
#[inline]
pub fn value_at(values: &[f64], specs: &[ParamSpec], index: usize) -> f64 {
    match values.get(index) {
        Some(v) => *v,
        None => specs.get(index).map_or(0.0, |s| s.default),
    }
}

/// An f64 stored as bits in an `AtomicU64`.
#[derive(Debug, Default)]
pub struct ParamCell(AtomicU64);

impl ParamCell {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    #[inline]
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Clamp into `[min, max]`. NaN falls back to `default`.
#[inline]
pub fn clamp_value(value: f64, min: f64, max: f64, default: f64) -> f64 {
    if value.is_nan() {
        default
    } else {
        value.clamp(min, max)
    }
}

/// A bounded numeric value with optional automation.
///
/// The stored value is always within `[min, max]`: writes are clamped, never rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub default: f64,
    pub unit: String,
    #[serde(rename = "value", with = "cell_value")]
    cell: Arc<ParamCell>,
    /// Lane that drives this parameter, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<LaneId>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, min: f64, max: f64, default: f64, unit: impl Into<String>) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        let default = clamp_value(default, min, max, min);
        Self {
            name: name.into(),
            min,
            max,
            default,
            unit: unit.into(),
            cell: Arc::new(ParamCell::new(default)),
            lane: None,
        }
    }

    pub fn from_spec(spec: &ParamSpec) -> Self {
        Self::new(spec.name, spec.min, spec.max, spec.default, spec.unit)
    }

    pub fn value(&self) -> f64 {
        self.cell.get()
    }

    /// Write a value, clamped to bounds. Returns the stored value.
    pub fn set(&self, value: f64) -> f64 {
        let clamped = clamp_value(value, self.min, self.max, self.default);
        self.cell.set(clamped);
        clamped
    }

    pub fn reset(&self) {
        self.cell.set(self.default);
    }

    pub fn clamp(&self, value: f64) -> f64 {
        clamp_value(value, self.min, self.max, self.default)
    }

    /// Shared handle to the value, for snapshots.
    pub fn cell(&self) -> Arc<ParamCell> {
        Arc::clone(&self.cell)
    }

    /// Re-clamp after deserialization, where bounds and value arrive independently.
    pub(crate) fn normalize(&mut self) {
        if self.min > self.max {
            std::mem::swap(&mut self.min, &mut self.max);
        }
        self.default = clamp_value(self.default, self.min, self.max, self.min);
        self.set(self.value());
    }

    /// Give this parameter its own cell (used when a model is duplicated).
    pub(crate) fn detach(&mut self) {
        self.cell = Arc::new(ParamCell::new(self.value()));
    }
}

mod cell_value {
    use super::ParamCell;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S: Serializer>(cell: &Arc<ParamCell>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(cell.get())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Arc<ParamCell>, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Ok(Arc::new(ParamCell::new(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_are_clamped_to_nearest_bound() {
        let p = Parameter::new("gain", -24.0, 24.0, 0.0, "dB");
        assert_eq!(p.set(100.0), 24.0);
        assert_eq!(p.value(), 24.0);
        assert_eq!(p.set(-100.0), -24.0);
        assert_eq!(p.value(), -24.0);
        assert_eq!(p.set(3.5), 3.5);
    }

    #[test]
    fn nan_write_falls_back_to_default() {
        let p = Parameter::new("mix", 0.0, 1.0, 0.5, "");
        p.set(f64::NAN);
        assert_eq!(p.value(), 0.5);
    }

    #[test]
    fn inverted_bounds_are_swapped() {
        let p = Parameter::new("x", 10.0, -10.0, 20.0, "");
        assert_eq!(p.min, -10.0);
        assert_eq!(p.max, 10.0);
        assert_eq!(p.default, 10.0);
    }

    #[test]
    fn clones_share_the_cell_until_detached() {
        let a = Parameter::new("x", 0.0, 1.0, 0.0, "");
        let mut b = a.clone();
        a.set(0.7);
        assert_eq!(b.value(), 0.7);
        b.detach();
        a.set(0.1);
        assert_eq!(b.value(), 0.7);
    }

    #[test]
    fn deserialized_value_is_normalized() {
        let json = r#"{"name":"x","min":0.0,"max":1.0,"default":0.5,"unit":"","value":4.0}"#;
        let mut p: Parameter = serde_json::from_str(json).unwrap();
        p.normalize();
        assert_eq!(p.value(), 1.0);
        let out = serde_json::to_string(&p).unwrap();
        assert!(out.contains(r#""value":1.0"#));
    }
}
