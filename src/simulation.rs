//! The per-slot simulation kernel.
//!
//! This is the reference form of the `Update` technique: the WGSL program
//! in [`crate::effect`] implements the same steps per fragment, and the
//! software backend runs this code directly. Slots never read each other,
//! so any evaluation order gives the same result.

use glam::{Mat4, Vec3, Vec4};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

use crate::emission::{is_born, EmissionTick};
use crate::environment::Ground;
use crate::grid::{SlotGrid, TexelGrid};
use crate::state::{EXPIRED_LIFE, SENTINEL_POSITION, SENTINEL_VELOCITY};

/// Constant inputs of the simulation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationParams {
    /// Spawn position (xyz, emitter space) and lifetime in seconds (w).
    pub init_pos_life: Vec4,
    /// Emitter transform applied to the spawn position.
    pub model: Mat4,
    /// Downward acceleration.
    pub gravity: f32,
    /// Fraction of speed kept after bouncing off the terrain.
    pub restitution: f32,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            init_pos_life: Vec4::new(0.0, 0.0, 0.0, 8.0),
            model: Mat4::from_translation(Vec3::new(0.0, 0.7, 0.0)),
            gravity: 9.8,
            restitution: 0.5,
        }
    }
}

/// Everything one slot reads in a step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotState {
    /// Position (xyz) and remaining life (w).
    pub position: Vec4,
    /// Velocity (xyz).
    pub velocity: Vec4,
}

impl SlotState {
    pub const SENTINEL: Self = Self {
        position: Vec4::new(
            SENTINEL_POSITION[0],
            SENTINEL_POSITION[1],
            SENTINEL_POSITION[2],
            SENTINEL_POSITION[3],
        ),
        velocity: Vec4::new(
            SENTINEL_VELOCITY[0],
            SENTINEL_VELOCITY[1],
            SENTINEL_VELOCITY[2],
            SENTINEL_VELOCITY[3],
        ),
    };

    /// Whether a live particle occupies the slot.
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.position.w > 0.0
    }
}

/// Advance one slot by one tick.
pub fn step_slot<G: Ground + ?Sized>(
    old: SlotState,
    birth_time: f32,
    init_velocity: Vec4,
    tick: &EmissionTick,
    params: &SimulationParams,
    ground: &G,
) -> SlotState {
    if !is_born(birth_time, tick.accumulated) {
        return SlotState::SENTINEL;
    }

    let life = old.position.w;
    if life < 0.0 {
        let spawn = params.model.transform_point3(params.init_pos_life.truncate());
        return SlotState {
            position: spawn.extend(params.init_pos_life.w),
            velocity: init_velocity.truncate().extend(0.0),
        };
    }
    if life == EXPIRED_LIFE {
        return SlotState {
            position: old.position,
            velocity: Vec4::ZERO,
        };
    }

    let dt = tick.elapsed;
    let mut vel = old.velocity.truncate();
    vel.y -= params.gravity * dt;
    let mut pos = old.position.truncate() + vel * dt;
    let mut life = life - dt;
    if life <= 0.0 {
        life = EXPIRED_LIFE;
    }

    let floor = ground.height_at(pos.x, pos.z);
    if pos.y < floor {
        pos.y = floor;
        let n = ground.normal_at(pos.x, pos.z);
        vel = (vel - 2.0 * vel.dot(n) * n) * params.restitution;
    }

    SlotState {
        position: pos.extend(life),
        velocity: vel.extend(0.0),
    }
}

/// Textures the step reads for every slot, besides the source generation.
pub struct StepInputs<'a, G: ?Sized> {
    pub birth_time: &'a [f32],
    pub init_velocity: &'a [[f32; 4]],
    pub ground: &'a G,
    pub params: &'a SimulationParams,
}

/// Run the kernel over every slot, reading `src` and writing `dst`.
///
/// `src` and `dst` are `(position, velocity)` texel slices of equal length.
pub fn step_generation<G: Ground + ?Sized>(
    src: (&[[f32; 4]], &[[f32; 4]]),
    dst: (&mut [[f32; 4]], &mut [[f32; 4]]),
    inputs: &StepInputs<'_, G>,
    tick: &EmissionTick,
) {
    let births = inputs.birth_time;
    let init_vel = inputs.init_velocity;
    let slots = dst.0.iter_mut().zip(dst.1.iter_mut()).enumerate();
    for (i, (dst_pos, dst_vel)) in slots {
        let old = SlotState {
            position: Vec4::from_array(src.0[i]),
            velocity: Vec4::from_array(src.1[i]),
        };
        let new = step_slot(
            old,
            births[i],
            Vec4::from_array(init_vel[i]),
            tick,
            inputs.params,
            inputs.ground,
        );
        *dst_pos = new.position.to_array();
        *dst_vel = new.velocity.to_array();
    }
}

/// Per-slot launch velocities: a narrow ring around the emitter, moving up.
pub fn initial_velocities(grid: &SlotGrid, seed: u64) -> TexelGrid<[f32; 4]> {
    let mut rng = StdRng::seed_from_u64(seed);
    TexelGrid::from_fn(grid.width(), grid.height(), |_, _| {
        let angle = rng.gen_range(-0.05f32..0.05) / 0.05 * std::f32::consts::PI;
        let r = rng.gen_range(-0.05f32..0.05) * 3.0;
        let up = 0.2 + rng.gen_range(-0.05f32..0.05).abs() * 3.0;
        [r * angle.cos(), up, r * angle.sin(), 0.0]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{EnvironmentMaps, TerrainParams};

    fn tick(accumulated: f32, elapsed: f32) -> EmissionTick {
        EmissionTick {
            accumulated,
            elapsed,
            wrapped: false,
        }
    }

    fn flat() -> EnvironmentMaps {
        EnvironmentMaps::flat(8, TerrainParams::default())
    }

    #[test]
    fn test_unborn_slot_is_forced_to_sentinel() {
        let live = SlotState {
            position: Vec4::new(1.0, 1.0, 1.0, 3.0),
            velocity: Vec4::ONE,
        };
        let out = step_slot(live, 5.0, Vec4::ZERO, &tick(1.0, 0.1), &SimulationParams::default(), &flat());
        assert_eq!(out, SlotState::SENTINEL);
    }

    #[test]
    fn test_spawn_uses_model_and_init_velocity() {
        let params = SimulationParams::default();
        let init = Vec4::new(0.1, 0.3, -0.1, 0.0);
        let out = step_slot(SlotState::SENTINEL, 0.0, init, &tick(0.0, 0.016), &params, &flat());
        assert_eq!(out.position, Vec4::new(0.0, 0.7, 0.0, 8.0));
        assert_eq!(out.velocity, init);
        assert!(out.is_alive());
    }

    #[test]
    fn test_integration_applies_gravity() {
        let params = SimulationParams::default();
        let old = SlotState {
            position: Vec4::new(0.0, 1.0, 0.0, 2.0),
            velocity: Vec4::new(1.0, 0.0, 0.0, 0.0),
        };
        let out = step_slot(old, 0.0, Vec4::ZERO, &tick(1.0, 0.1), &params, &flat());
        assert!((out.velocity.y + 0.98).abs() < 1e-5);
        assert!((out.position.x - 0.1).abs() < 1e-6);
        assert!((out.position.y - (1.0 - 0.098)).abs() < 1e-5);
        assert!((out.position.w - 1.9).abs() < 1e-6);
    }

    #[test]
    fn test_terrain_bounce_reflects_and_damps() {
        let params = SimulationParams {
            gravity: 0.0,
            ..Default::default()
        };
        let old = SlotState {
            position: Vec4::new(0.0, 0.01, 0.0, 2.0),
            velocity: Vec4::new(0.0, -1.0, 0.0, 0.0),
        };
        let out = step_slot(old, 0.0, Vec4::ZERO, &tick(1.0, 0.1), &params, &flat());
        assert_eq!(out.position.y, 0.0);
        assert!((out.velocity.y - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_expired_particle_stays_dead_until_wrap() {
        let params = SimulationParams::default();
        let old = SlotState {
            position: Vec4::new(0.0, 2.0, 0.0, 0.05),
            velocity: Vec4::ZERO,
        };
        let dying = step_slot(old, 0.0, Vec4::ZERO, &tick(1.0, 0.1), &params, &flat());
        assert_eq!(dying.position.w, EXPIRED_LIFE);
        assert!(!dying.is_alive());

        let still = step_slot(dying, 0.0, Vec4::Y, &tick(1.1, 0.1), &params, &flat());
        assert_eq!(still.position.w, EXPIRED_LIFE);
        assert_eq!(still.velocity, Vec4::ZERO);
    }

    #[test]
    fn test_initial_velocities_in_range() {
        let grid = SlotGrid::new(1024, 256).unwrap();
        let vels = initial_velocities(&grid, 607);
        assert_eq!(vels, initial_velocities(&grid, 607));
        for v in vels.as_slice() {
            let radial = (v[0] * v[0] + v[2] * v[2]).sqrt();
            assert!(radial <= 0.15 + 1e-6);
            assert!((0.2..=0.35).contains(&v[1]));
            assert_eq!(v[3], 0.0);
        }
    }
}
