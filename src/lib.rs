//! # gpups - texture-resident particle simulation
//!
//! Tens of thousands of particles live entirely in textures: one texel per
//! particle slot, two generations of position and velocity, and a fixed
//! birth time per slot. Every frame the simulation reads one generation and
//! writes the other, then the result is composited with a height-mapped
//! terrain and a fog capture into the final image.
//!
//! ## Quick Start
//!
//! ```
//! use gpups::prelude::*;
//!
//! let config = AppConfig::default();
//! let settings = RenderSettings { width: 64, height: 48, ..config.render_settings() };
//! let maps = EnvironmentMaps::procedural(32, config.terrain);
//! let backend = SoftwareBackend::new(settings.width, settings.height);
//!
//! let mut pipeline = Pipeline::initialize(backend, &settings, &config.particles, &maps).unwrap();
//! for _ in 0..3 {
//!     pipeline.tick(1.0 / 60.0).unwrap();
//! }
//! let frame = pipeline.capture().unwrap();
//! assert_eq!(frame.dimensions(), (64, 48));
//! ```
//!
//! ## Core Concepts
//!
//! ### Slots
//!
//! A particle is a position in a [`SlotGrid`](grid::SlotGrid), row-major,
//! `width` slots per row. Slots past `max_particles` pad the last row and
//! are never born.
//!
//! ### Generations
//!
//! [`GenerationPair`](state::GenerationPair) holds two complete copies of
//! the state and an active flag. The update writes `next()` and only then
//! swaps, so no reader ever sees a half-written generation.
//!
//! ### Emission
//!
//! [`EmissionSchedule`](emission::EmissionSchedule) gives slot `i` the birth
//! time `i / frequency` and advances an accumulator by the frame time. The
//! accumulator wraps to zero after `max_particles / frequency` seconds,
//! which recycles every slot.
//!
//! ### Backends
//!
//! Everything device-facing goes through [`RenderBackend`]. The
//! [`SoftwareBackend`] runs the techniques on the CPU and is what the tests
//! use; [`WgpuBackend`] runs the WGSL techniques on a headless device.

pub mod backend;
pub mod bootstrap;
pub mod camera;
pub mod config;
pub mod effect;
pub mod emission;
pub mod environment;
pub mod error;
pub mod gpu;
pub mod grid;
pub mod pass;
pub mod pipeline;
pub mod simulation;
pub mod state;
pub mod system;
pub mod targets;
pub mod time;

pub use backend::software::SoftwareBackend;
pub use backend::{create_backend, BackendKind, RenderBackend};
pub use config::{AppConfig, ParticleConfig, RenderSettings};
pub use error::{
    AllocationError, CapabilityError, ConfigError, ConfigurationError, FrameError, SetupError,
};
pub use glam::{Mat4, Vec3, Vec4};
pub use gpu::WgpuBackend;
pub use pipeline::{AbortSignal, FrameStatus, PassStage, Pipeline};

/// Convenient re-exports for typical usage.
///
/// ```
/// use gpups::prelude::*;
/// ```
pub mod prelude {
    pub use crate::backend::software::SoftwareBackend;
    pub use crate::backend::{create_backend, BackendKind, RenderBackend};
    pub use crate::camera::Camera;
    pub use crate::config::{AppConfig, ColorFormat, ParticleConfig, RenderSettings};
    pub use crate::environment::{EnvironmentMaps, TerrainParams};
    pub use crate::error::{FrameError, SetupError};
    pub use crate::gpu::WgpuBackend;
    pub use crate::pipeline::{AbortSignal, FrameStatus, PassStage, Pipeline};
    pub use glam::{Vec3, Vec4};
}
