//! DSP: the processors behind every effect unit, plus the note synthesiser
//! used to render MIDI tracks.
//!
//! Every effect processor follows the same shape: a `PARAMS` table, a
//! `set_params(&[f64])` that reads values in table order, and an in-place
//! `process_block(left, right)` that replaces its input with the wet signal.
//! Blending with the dry path is the chain's job.

pub mod buffer;
pub mod chorus;
pub mod compressor;
pub mod delay;
pub mod distortion;
pub mod envelope;
pub mod eq;
pub mod filter;
pub mod gate;
pub mod limiter;
pub mod mixer;
pub mod oscillator;
pub mod phaser;
pub mod reverb;
pub mod voice;
