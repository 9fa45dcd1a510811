//! Texture-resident particle state and its per-tick update.
//!
//! A [`ParticleSystem`] owns both generations of position and velocity
//! textures, the birth-time and launch-velocity textures, and the emission
//! schedule. [`ParticleSystem::update`] runs the `Update` technique from the
//! current generation into the next one and only then swaps.

use glam::Vec4;
use tracing::{debug, info, trace};

use crate::backend::{
    PixelFormat, RenderBackend, RenderTargetDesc, RenderTargetId, TechniqueId, TextureDesc,
    TextureId, Topology,
};
use crate::config::ParticleConfig;
use crate::effect::{self, param};
use crate::emission::{EmissionSchedule, EmissionTick};
use crate::environment::TerrainParams;
use crate::error::{AllocationError, FrameError, SetupError};
use crate::grid::{SlotGrid, TexelGrid};
use crate::pass::{self, PassDescriptor};
use crate::pipeline::AbortSignal;
use crate::simulation::{initial_velocities, SimulationParams};
use crate::state::{GenerationPair, SENTINEL_POSITION, SENTINEL_VELOCITY};

/// One generation of particle state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Generation {
    /// Position (xyz) and remaining life (w) per slot.
    pub position: TextureId,
    /// Velocity (xyz) per slot.
    pub velocity: TextureId,
    /// Render target writing `position` and `velocity` together.
    pub target: RenderTargetId,
}

/// Terrain textures the update samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundTextures {
    pub height_map: TextureId,
    pub normal_map: TextureId,
    pub terrain: TerrainParams,
}

/// Resources created so far, released again if construction fails.
#[derive(Default)]
struct Allocations {
    textures: Vec<TextureId>,
    targets: Vec<RenderTargetId>,
}

impl Allocations {
    fn texture<B: RenderBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        desc: &TextureDesc,
        data: &[u8],
    ) -> Result<TextureId, AllocationError> {
        let id = backend.create_texture(desc)?;
        self.textures.push(id);
        backend.write_texture(id, data)?;
        Ok(id)
    }

    fn release<B: RenderBackend + ?Sized>(self, backend: &mut B) {
        for target in self.targets {
            backend.release_render_target(target);
        }
        for texture in self.textures {
            backend.release_texture(texture);
        }
    }
}

/// Particle state on the device.
#[derive(Debug)]
pub struct ParticleSystem {
    grid: SlotGrid,
    schedule: EmissionSchedule,
    generations: GenerationPair<Generation>,
    birth_time: TextureId,
    init_velocity: TextureId,
    update: TechniqueId,
    params: SimulationParams,
    ground: GroundTextures,
}

impl ParticleSystem {
    /// Allocate the state textures and assign birth times.
    ///
    /// Every slot starts as the sentinel. If any allocation fails, the
    /// resources created up to that point are released before returning.
    pub fn new<B: RenderBackend + ?Sized>(
        backend: &mut B,
        grid: SlotGrid,
        config: &ParticleConfig,
        ground: GroundTextures,
    ) -> Result<Self, SetupError> {
        let schedule = EmissionSchedule::new(config.emit_frequency, &grid)?;
        let mut allocations = Allocations::default();
        match Self::allocate(backend, &grid, &schedule, config, &mut allocations) {
            Ok((generations, birth_time, init_velocity, update)) => {
                info!(
                    target: "pipeline",
                    max_particles = grid.max_particles(),
                    width = grid.width(),
                    height = grid.height(),
                    "particle state allocated"
                );
                Ok(Self {
                    grid,
                    schedule,
                    generations,
                    birth_time,
                    init_velocity,
                    update,
                    params: config.simulation_params(),
                    ground,
                })
            }
            Err(err) => {
                allocations.release(backend);
                Err(err.into())
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn allocate<B: RenderBackend + ?Sized>(
        backend: &mut B,
        grid: &SlotGrid,
        schedule: &EmissionSchedule,
        config: &ParticleConfig,
        allocations: &mut Allocations,
    ) -> Result<(GenerationPair<Generation>, TextureId, TextureId, TechniqueId), AllocationError> {
        let (w, h) = (grid.width(), grid.height());
        let state = |label: &str| TextureDesc::d2(label, w, h, PixelFormat::Rgba32Float);

        let birth_time = allocations.texture(
            backend,
            &TextureDesc::d2("birth_time", w, h, PixelFormat::R32Float),
            schedule.birth_times().as_bytes(),
        )?;
        let init_velocity = allocations.texture(
            backend,
            &state("init_velocity"),
            initial_velocities(grid, config.seed).as_bytes(),
        )?;

        let sentinel_pos = TexelGrid::filled(w, h, SENTINEL_POSITION);
        let sentinel_vel = TexelGrid::filled(w, h, SENTINEL_VELOCITY);
        let mut generation = |backend: &mut B, index: usize| -> Result<Generation, AllocationError> {
            let position =
                allocations.texture(backend, &state(&format!("position_{}", index)), sentinel_pos.as_bytes())?;
            let velocity =
                allocations.texture(backend, &state(&format!("velocity_{}", index)), sentinel_vel.as_bytes())?;
            let target = backend.create_render_target(&RenderTargetDesc {
                label: format!("generation_{}", index),
                colors: vec![position, velocity],
                depth: None,
            })?;
            allocations.targets.push(target);
            Ok(Generation {
                position,
                velocity,
                target,
            })
        };
        let first = generation(backend, 0)?;
        let second = generation(backend, 1)?;

        let update = backend.load_technique(effect::UPDATE)?;
        Ok((GenerationPair::new(first, second), birth_time, init_velocity, update))
    }

    /// Reassign birth times for a new emission frequency and restart the cycle.
    pub fn auto_emit<B: RenderBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        frequency: f32,
    ) -> Result<(), SetupError> {
        let schedule = EmissionSchedule::new(frequency, &self.grid)?;
        backend.write_texture(self.birth_time, schedule.birth_times().as_bytes())?;
        self.schedule = schedule;
        debug!(target: "emission", frequency, "birth times reassigned");
        Ok(())
    }

    /// Advance the schedule by `dt` and step every slot into the next generation.
    ///
    /// The schedule and the generation flag only change once the write has
    /// finished and `abort` is still clear; an aborted tick leaves both as
    /// they were.
    pub fn update<B: RenderBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        dt: f32,
        abort: &AbortSignal,
    ) -> Result<EmissionTick, FrameError> {
        let mut schedule = self.schedule.clone();
        let tick = schedule.advance(dt);
        let src = *self.generations.current();
        let dst = *self.generations.next();
        let p = &self.params;

        let update = PassDescriptor::new("update", Some(dst.target), self.update, 3, Topology::TriangleList)
            .input(param::ACCUMULATE_TIME, tick.accumulated)
            .input(param::ELAPSE_TIME, tick.elapsed)
            .input(param::INIT_POS_LIFE, p.init_pos_life)
            .input(param::MODEL, p.model)
            .input(param::PHYSICS, Vec4::new(p.gravity, p.restitution, 0.0, 0.0))
            .input(
                param::TERRAIN,
                Vec4::new(self.ground.terrain.extent, self.ground.terrain.height_scale, 0.0, 0.0),
            )
            .input(param::PARTICLE_POS_TEX, src.position)
            .input(param::PARTICLE_VEL_TEX, src.velocity)
            .input(param::PARTICLE_BIRTH_TIME_TEX, self.birth_time)
            .input(param::PARTICLE_INIT_VEL_TEX, self.init_velocity)
            .input(param::HEIGHT_MAP_TEX, self.ground.height_map)
            .input(param::NORMAL_MAP_TEX, self.ground.normal_map);
        pass::execute(backend, &update)?;

        if abort.is_raised() {
            debug!(target: "pipeline", "tick aborted before swap");
            return Err(FrameError::Aborted);
        }
        self.schedule = schedule;
        self.generations.swap();
        trace!(
            target: "pipeline",
            accumulated = tick.accumulated,
            active = self.generations.active_index(),
            "generation swapped"
        );
        Ok(tick)
    }

    /// Release every texture and render target the system owns.
    pub fn release<B: RenderBackend + ?Sized>(self, backend: &mut B) {
        for generation in self.generations.into_inner() {
            backend.release_render_target(generation.target);
            backend.release_texture(generation.position);
            backend.release_texture(generation.velocity);
        }
        backend.release_texture(self.birth_time);
        backend.release_texture(self.init_velocity);
    }

    #[inline]
    pub fn grid(&self) -> &SlotGrid {
        &self.grid
    }

    #[inline]
    pub fn schedule(&self) -> &EmissionSchedule {
        &self.schedule
    }

    /// Readable generation.
    #[inline]
    pub fn current(&self) -> &Generation {
        self.generations.current()
    }

    /// Generation the next update writes.
    #[inline]
    pub fn next(&self) -> &Generation {
        self.generations.next()
    }

    /// Position texture of the readable generation.
    #[inline]
    pub fn pos_texture(&self) -> TextureId {
        self.generations.current().position
    }

    #[inline]
    pub fn birth_time_texture(&self) -> TextureId {
        self.birth_time
    }

    #[inline]
    pub fn init_velocity_texture(&self) -> TextureId {
        self.init_velocity
    }

    #[inline]
    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    /// Every texture the system owns.
    pub fn textures(&self) -> Vec<TextureId> {
        let mut textures: Vec<TextureId> = self
            .generations
            .iter()
            .flat_map(|g| [g.position, g.velocity])
            .collect();
        textures.push(self.birth_time);
        textures.push(self.init_velocity);
        textures
    }
}
