//! The per-frame render/composite pipeline.
//!
//! [`Pipeline`] is what a host drives:
//!
//! - [`Pipeline::initialize`] validates the configuration, checks the
//!   device, and allocates every resource, or nothing at all.
//! - [`Pipeline::tick`] runs one frame: terrain into the scene target, the
//!   particle update and sprite pass into the fog target, then the final
//!   blend onto the backbuffer.
//! - [`Pipeline::on_resize`] rebuilds the viewport-sized targets.
//! - [`Pipeline::shutdown`] releases everything. Dropping the pipeline
//!   does the same.
//!
//! # Example
//!
//! ```
//! use gpups::prelude::*;
//!
//! let settings = RenderSettings { width: 64, height: 48, ..RenderSettings::default() };
//! let particles = ParticleConfig { max_particles: 1024, grid_width: 32, ..ParticleConfig::default() };
//! let maps = EnvironmentMaps::procedural(32, TerrainParams::default());
//! let backend = SoftwareBackend::new(settings.width, settings.height);
//!
//! let mut pipeline = Pipeline::initialize(backend, &settings, &particles, &maps).unwrap();
//! let status = pipeline.tick(0.002).unwrap();
//! assert_eq!(status.frame, 1);
//! pipeline.shutdown();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use glam::Vec4;
use tracing::{debug, info, trace, warn};

use crate::backend::{
    ClearValues, PixelFormat, RenderBackend, TechniqueId, TextureDesc, TextureId, Topology,
};
use crate::bootstrap::{confirm_device, DeviceReport};
use crate::camera::Camera;
use crate::config::{ParticleConfig, RenderSettings};
use crate::effect::{self, param};
use crate::environment::{EnvironmentMaps, NoiseVolume};
use crate::error::{AllocationError, FrameError, SetupError};
use crate::pass::{self, PassDescriptor};
use crate::system::{GroundTextures, ParticleSystem};
use crate::targets::RenderTargetSet;
use crate::time::FrameClock;

/// Background of the scene target.
pub const SKY_COLOR: [f32; 4] = [0.2, 0.4, 0.6, 1.0];

/// Quads per side of the terrain mesh.
pub const TERRAIN_RESOLUTION: u32 = 64;

/// Direction towards the light.
const LIGHT_DIR: Vec4 = Vec4::new(0.4, 1.0, 0.3, 0.0);

/// HUD text color.
pub const HUD_COLOR: [f32; 4] = [1.0, 1.0, 0.0, 1.0];

/// Vertical distance between HUD lines, in pixels.
pub const HUD_LINE_HEIGHT: f32 = 18.0;

/// Host-side flag that abandons the frame in flight.
///
/// Cloned handles share one flag, so a window-close handler can raise it
/// while the pipeline is ticking. Once raised it stays raised until
/// [`AbortSignal::clear`] is called.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Passes of a frame, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassStage {
    Terrain,
    Particles,
    FinalBlend,
}

impl PassStage {
    pub const ALL: [PassStage; 3] = [PassStage::Terrain, PassStage::Particles, PassStage::FinalBlend];

    /// Stage after this one; `None` once the frame is complete.
    pub fn next(self) -> Option<PassStage> {
        match self {
            PassStage::Terrain => Some(PassStage::Particles),
            PassStage::Particles => Some(PassStage::FinalBlend),
            PassStage::FinalBlend => None,
        }
    }
}

/// Result of a completed tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameStatus {
    /// Frames completed so far, this one included.
    pub frame: u64,
    /// Emission accumulator after this tick.
    pub accumulated_time: f32,
    /// Whether the emission cycle wrapped on this tick.
    pub wrapped: bool,
    /// Completed emission cycles.
    pub cycles: u64,
    /// Current FPS estimate.
    pub fps: f32,
}

/// Height, normal and noise textures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvironmentTextures {
    pub height_map: TextureId,
    pub normal_map: TextureId,
    pub noise_volume: TextureId,
}

impl EnvironmentTextures {
    fn upload<B: RenderBackend + ?Sized>(
        backend: &mut B,
        maps: &EnvironmentMaps,
        noise: &NoiseVolume,
    ) -> Result<Self, AllocationError> {
        let uploads: [(TextureDesc, &[u8]); 3] = [
            (
                TextureDesc::d2("height_map", maps.height.width(), maps.height.height(), PixelFormat::R32Float),
                maps.height.as_bytes(),
            ),
            (
                TextureDesc::d2(
                    "normal_map",
                    maps.normal.width(),
                    maps.normal.height(),
                    PixelFormat::Rgba32Float,
                ),
                maps.normal.as_bytes(),
            ),
            (
                TextureDesc::d3(
                    "noise_volume",
                    noise.size(),
                    noise.size(),
                    noise.size(),
                    PixelFormat::Rgba8Unorm,
                ),
                noise.as_bytes(),
            ),
        ];

        let mut created = Vec::with_capacity(uploads.len());
        for (desc, data) in &uploads {
            let result = backend.create_texture(desc).and_then(|id| {
                created.push(id);
                backend.write_texture(id, data)
            });
            if let Err(err) = result {
                for id in created {
                    backend.release_texture(id);
                }
                return Err(err);
            }
        }
        Ok(Self {
            height_map: created[0],
            normal_map: created[1],
            noise_volume: created[2],
        })
    }

    fn release<B: RenderBackend + ?Sized>(self, backend: &mut B) {
        backend.release_texture(self.height_map);
        backend.release_texture(self.normal_map);
        backend.release_texture(self.noise_volume);
    }
}

/// Draw techniques of a frame.
#[derive(Debug, Clone, Copy)]
struct Techniques {
    terrain: TechniqueId,
    particles: TechniqueId,
    blend: TechniqueId,
}

impl Techniques {
    fn load<B: RenderBackend + ?Sized>(backend: &mut B) -> Result<Self, AllocationError> {
        Ok(Self {
            terrain: backend.load_technique(effect::TERRAIN)?,
            particles: backend.load_technique(effect::PARTICLES)?,
            blend: backend.load_technique(effect::BLEND)?,
        })
    }
}

/// Everything [`Pipeline::shutdown`] releases.
#[derive(Debug)]
struct Resources {
    environment: EnvironmentTextures,
    system: ParticleSystem,
    targets: RenderTargetSet,
    techniques: Techniques,
}

impl Resources {
    fn create<B: RenderBackend + ?Sized>(
        backend: &mut B,
        settings: &RenderSettings,
        particles: &ParticleConfig,
        maps: &EnvironmentMaps,
    ) -> Result<Self, SetupError> {
        let grid = particles.validate()?;
        let noise = NoiseVolume::generate(particles.noise_size, particles.seed);

        let environment = EnvironmentTextures::upload(backend, maps, &noise)?;
        let ground = GroundTextures {
            height_map: environment.height_map,
            normal_map: environment.normal_map,
            terrain: maps.terrain,
        };
        let system = match ParticleSystem::new(backend, grid, particles, ground) {
            Ok(system) => system,
            Err(err) => {
                environment.release(backend);
                return Err(err);
            }
        };
        let built = Techniques::load(backend).and_then(|techniques| {
            backend.resize_backbuffer(settings.width, settings.height)?;
            let targets = RenderTargetSet::create(backend, settings.width, settings.height)?;
            Ok((techniques, targets))
        });
        match built {
            Ok((techniques, targets)) => Ok(Self {
                environment,
                system,
                targets,
                techniques,
            }),
            Err(err) => {
                system.release(backend);
                environment.release(backend);
                Err(err.into())
            }
        }
    }

    fn release<B: RenderBackend + ?Sized>(self, backend: &mut B) {
        self.targets.release(backend);
        self.system.release(backend);
        self.environment.release(backend);
    }
}

/// Particle simulation composited with terrain and fog.
pub struct Pipeline<B: RenderBackend> {
    backend: B,
    settings: RenderSettings,
    device: DeviceReport,
    camera: Camera,
    clock: FrameClock,
    point_radius: f32,
    terrain_params: Vec4,
    abort: AbortSignal,
    stage: Option<PassStage>,
    resources: Option<Resources>,
}

impl<B: RenderBackend> Pipeline<B> {
    /// Validate, check the device, and allocate every resource.
    ///
    /// Configuration errors are reported before the device is queried, and
    /// capability errors before anything is allocated. If an allocation
    /// fails, everything allocated up to that point is released.
    pub fn initialize(
        mut backend: B,
        settings: &RenderSettings,
        particles: &ParticleConfig,
        environment: &EnvironmentMaps,
    ) -> Result<Self, SetupError> {
        settings.validate()?;
        particles.validate()?;
        let device = confirm_device(&mut backend)?;
        let resources = Resources::create(&mut backend, settings, particles, environment)?;

        info!(
            target: "pipeline",
            backend = backend.name(),
            width = settings.width,
            height = settings.height,
            particles = particles.max_particles,
            frequency = particles.emit_frequency,
            "pipeline initialized"
        );
        Ok(Self {
            backend,
            settings: *settings,
            device,
            camera: Camera::default(),
            clock: FrameClock::new(),
            point_radius: particles.point_radius,
            terrain_params: Vec4::new(
                environment.terrain.extent,
                environment.terrain.height_scale,
                TERRAIN_RESOLUTION as f32,
                0.0,
            ),
            abort: AbortSignal::new(),
            stage: None,
            resources: Some(resources),
        })
    }

    /// Run one frame of `dt` seconds.
    ///
    /// On `Ok` the frame has been composited onto the backbuffer. If the
    /// abort signal is raised before the generations swap, the frame is
    /// abandoned with [`FrameError::Aborted`] and the particle state and
    /// emission schedule are left as they were.
    pub fn tick(&mut self, dt: f32) -> Result<FrameStatus, FrameError> {
        let res = self.resources.as_mut().ok_or(FrameError::ShutDown)?;
        if self.abort.is_raised() {
            return Err(FrameError::Aborted);
        }
        self.stage = None;

        let mut clock = self.clock.clone();
        clock.advance(dt);
        let view_proj = self.camera.view_proj(self.settings.aspect());
        let (right, up) = self.camera.billboard_axes();
        let targets = &res.targets;
        let env = res.environment;

        let terrain = PassDescriptor::new(
            "terrain",
            Some(targets.scene()),
            res.techniques.terrain,
            TERRAIN_RESOLUTION * TERRAIN_RESOLUTION * 6,
            Topology::TriangleList,
        )
        .clear(ClearValues::all(SKY_COLOR))
        .input(param::VIEW_PROJ, view_proj)
        .input(param::TERRAIN, self.terrain_params)
        .input(param::LIGHT_DIR, LIGHT_DIR)
        .input(param::HEIGHT_MAP_TEX, env.height_map)
        .input(param::NORMAL_MAP_TEX, env.normal_map);
        pass::execute(&mut self.backend, &terrain)?;
        self.stage = Some(PassStage::Terrain);

        let emission = res.system.update(&mut self.backend, dt, &self.abort)?;
        let grid = *res.system.grid();
        let particles = PassDescriptor::new(
            "particles",
            Some(targets.fog()),
            res.techniques.particles,
            4,
            Topology::TriangleStrip,
        )
        .clear(ClearValues::all([0.0; 4]))
        .instances(grid.slot_count())
        .input(param::VIEW_PROJ, view_proj)
        .input(param::CAMERA_RIGHT, right.extend(0.0))
        .input(param::CAMERA_UP, up.extend(0.0))
        .input(param::POINT_RADIUS, self.point_radius)
        .input(param::GRID, Vec4::new(grid.width() as f32, grid.height() as f32, 0.0, 0.0))
        .input(param::PARTICLE_POS_TEX, res.system.pos_texture())
        .input(param::SCENE_TEX, targets.scene_color())
        .input(param::NOISE_VOLUME_TEX, env.noise_volume);
        pass::execute(&mut self.backend, &particles)?;
        self.stage = Some(PassStage::Particles);

        let blend = PassDescriptor::new("blend", None, res.techniques.blend, 3, Topology::TriangleList)
            .clear(ClearValues::all(SKY_COLOR))
            .input(param::SCENE_TEX, targets.scene_color())
            .input(param::FOG_TEX, targets.fog_color());
        pass::execute(&mut self.backend, &blend)?;
        self.backend.draw_text(0.0, 0.0, HUD_COLOR, "GPU Particle System");
        self.backend
            .draw_text(0.0, HUD_LINE_HEIGHT, HUD_COLOR, &format!("FPS: {:.1}", clock.fps()));
        self.stage = Some(PassStage::FinalBlend);

        self.clock = clock;
        let status = FrameStatus {
            frame: self.clock.frame(),
            accumulated_time: emission.accumulated,
            wrapped: emission.wrapped,
            cycles: res.system.schedule().cycles(),
            fps: self.clock.fps(),
        };
        trace!(target: "pipeline", frame = status.frame, t_acc = status.accumulated_time, "frame complete");
        Ok(status)
    }

    /// Rebuild the backbuffer and viewport targets at `width x height`.
    ///
    /// If the new targets cannot be allocated the old ones stay in use.
    pub fn on_resize(&mut self, width: u32, height: u32) -> Result<(), SetupError> {
        let res = self
            .resources
            .as_mut()
            .ok_or_else(|| SetupError::Backend("pipeline has been shut down".to_string()))?;
        let settings = RenderSettings {
            width,
            height,
            ..self.settings
        };
        settings.validate()?;

        self.backend.resize_backbuffer(width, height)?;
        if let Err(err) = res.targets.resize(&mut self.backend, width, height) {
            if let Err(restore) = self
                .backend
                .resize_backbuffer(self.settings.width, self.settings.height)
            {
                warn!(target: "pipeline", %restore, "failed to restore backbuffer size");
            }
            return Err(err.into());
        }
        self.settings = settings;
        debug!(target: "pipeline", width, height, "viewport resized");
        Ok(())
    }

    /// Release every resource. Calling it again does nothing.
    pub fn shutdown(&mut self) {
        if let Some(resources) = self.resources.take() {
            resources.release(&mut self.backend);
            info!(target: "pipeline", frames = self.clock.frame(), "pipeline shut down");
        }
    }

    /// Handle for abandoning frames from elsewhere.
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Reassign birth times for a new emission frequency.
    pub fn set_emit_frequency(&mut self, frequency: f32) -> Result<(), SetupError> {
        let res = self
            .resources
            .as_mut()
            .ok_or_else(|| SetupError::Backend("pipeline has been shut down".to_string()))?;
        res.system.auto_emit(&mut self.backend, frequency)
    }

    /// Last pass completed in the current or most recent frame.
    #[inline]
    pub fn stage(&self) -> Option<PassStage> {
        self.stage
    }

    #[inline]
    pub fn is_shut_down(&self) -> bool {
        self.resources.is_none()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    /// Capabilities accepted at initialization.
    pub fn device(&self) -> &DeviceReport {
        &self.device
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    pub fn clock(&self) -> &FrameClock {
        &self.clock
    }

    pub fn system(&self) -> Option<&ParticleSystem> {
        self.resources.as_ref().map(|r| &r.system)
    }

    pub fn targets(&self) -> Option<&RenderTargetSet> {
        self.resources.as_ref().map(|r| &r.targets)
    }

    pub fn environment(&self) -> Option<&EnvironmentTextures> {
        self.resources.as_ref().map(|r| &r.environment)
    }

    /// Copy of the last composited frame.
    pub fn capture(&mut self) -> Result<image::RgbaImage, FrameError> {
        self.backend.read_backbuffer()
    }
}

impl<B: RenderBackend> Drop for Pipeline<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let mut stage = Some(PassStage::Terrain);
        let mut seen = Vec::new();
        while let Some(s) = stage {
            seen.push(s);
            stage = s.next();
        }
        assert_eq!(seen, PassStage::ALL);
    }

    #[test]
    fn test_abort_signal_is_shared() {
        let signal = AbortSignal::new();
        let handle = signal.clone();
        handle.raise();
        assert!(signal.is_raised());
        signal.clear();
        assert!(!handle.is_raised());
    }
}
