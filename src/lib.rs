//! Roger Renderer Library
//!
//! Real-time audio output renderer: lock-free slice queue between the
//! playback engine and the hardware pull callback, with PCM, native
//! passthrough and spoofed IEC61937 passthrough output paths.

pub mod audio;
pub mod backend;
pub mod error;
pub mod renderer;

pub use error::RenderError;
pub use renderer::{Renderer, RendererConfig};
