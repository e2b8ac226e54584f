pub mod automation;
pub mod config;
pub mod dsp;
pub mod effect;
pub mod engine;
pub mod error;
pub mod graph;
pub mod parameter;
pub mod project;
pub mod transport;
pub mod types;

pub use automation::{AutomationLane, AutomationMode, AutomationPoint, ParamTarget};
pub use config::EngineConfig;
pub use effect::{EffectChain, EffectType, EffectUnit};
pub use engine::Engine;
pub use engine::events::EngineEvent;
pub use engine::export::{EffectSpec, ExportFormat, Normalization};
pub use engine::offline::{RenderJob, RenderTask, RenderedAudio, TailMode};
pub use engine::realtime::RealtimeProcessor;
pub use error::{AutomationLockError, CycleError, EngineError, OfflineRenderFailure};
pub use project::{Clip, ClipAudio, Humanize, MidiNote, Project};
pub use types::{BusId, EffectId, LaneId, NodeId, Region, TrackId, TrackKind};

use serde::Serialize;
use wasm_bindgen::prelude::*;

/// The crate version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// WASM-exposed: return the mixdown-core version string.
#[wasm_bindgen]
pub fn core_version() -> String {
    VERSION.to_string()
}

/// Summary of a project document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectInfo {
    pub name: String,
    pub tracks: usize,
    pub buses: usize,
    pub effects: usize,
    pub lanes: usize,
    pub duration_seconds: f64,
    pub tail_seconds: f64,
}

/// Load a project document into a default engine and describe it.
pub fn inspect_project(json: &str) -> Result<ProjectInfo, EngineError> {
    let project = Project::from_json(json)?;
    let sample_rate = EngineConfig::default().sample_rate;
    Ok(ProjectInfo {
        name: project.name.clone(),
        tracks: project.tracks().len(),
        buses: project.buses().len(),
        effects: project.effect_count(),
        lanes: project.lanes().len(),
        duration_seconds: project.content_end() as f64 / sample_rate,
        tail_seconds: project.tail_seconds(),
    })
}

/// Render a whole project document to 16-bit WAV bytes.
pub fn render_project(json: &str, tail_seconds: f64) -> Result<Vec<u8>, EngineError> {
    let mut engine = Engine::new(EngineConfig::default());
    engine.load_project(json)?;
    let region = engine.project_region();
    let audio = engine.render_offline(region.start, region.frames, tail_seconds)?;
    Ok(engine::export::encode_wav(&audio, ExportFormat::Int16)?)
}

/// WASM-exposed: render a project document (JSON) to a WAV byte array.
#[wasm_bindgen]
pub fn render_project_wav(json: &str, tail_seconds: f64) -> Result<Vec<u8>, JsValue> {
    render_project(json, tail_seconds).map_err(|e| JsValue::from_str(&format!("{e}")))
}

/// WASM-exposed: summarise a project document.
#[wasm_bindgen]
pub fn project_info(json: &str) -> Result<JsValue, JsValue> {
    let info = inspect_project(json).map_err(|e| JsValue::from_str(&format!("{e}")))?;
    serde_wasm_bindgen::to_value(&info).map_err(|e| JsValue::from_str(&format!("{e}")))
}
