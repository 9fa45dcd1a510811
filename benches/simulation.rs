//! Benchmarks for the CPU side of the simulation.
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use gpups::emission::{EmissionSchedule, EmissionTick};
use gpups::environment::{EnvironmentMaps, TerrainParams};
use gpups::grid::SlotGrid;
use gpups::prelude::*;
use gpups::simulation::{initial_velocities, step_generation, SimulationParams, StepInputs};
use gpups::state::{SENTINEL_POSITION, SENTINEL_VELOCITY};

fn bench_birth_times(c: &mut Criterion) {
    let mut group = c.benchmark_group("birth_times");
    for &count in &[4096u32, 65536, 262144] {
        let grid = SlotGrid::new(count, 256).unwrap();
        let schedule = EmissionSchedule::new(500.0, &grid).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(count), &schedule, |b, schedule| {
            b.iter(|| black_box(schedule.birth_times()))
        });
    }
    group.finish();
}

fn bench_step_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("step_generation");
    let maps = EnvironmentMaps::procedural(128, TerrainParams::default());
    let params = SimulationParams::default();

    for &count in &[4096u32, 65536] {
        let grid = SlotGrid::new(count, 256).unwrap();
        let schedule = EmissionSchedule::new(500.0, &grid).unwrap();
        let births = schedule.birth_times();
        let init_vel = initial_velocities(&grid, 607);
        let slots = grid.slot_count() as usize;
        let src_pos = vec![SENTINEL_POSITION; slots];
        let src_vel = vec![SENTINEL_VELOCITY; slots];
        let mut dst_pos = vec![[0.0; 4]; slots];
        let mut dst_vel = vec![[0.0; 4]; slots];
        let inputs = StepInputs {
            birth_time: births.as_slice(),
            init_velocity: init_vel.as_slice(),
            ground: &maps,
            params: &params,
        };
        // Every slot born, so each one spawns.
        let tick = EmissionTick {
            accumulated: schedule.cycle_length(),
            elapsed: 1.0 / 60.0,
            wrapped: false,
        };

        group.bench_function(BenchmarkId::from_parameter(count), |b| {
            b.iter(|| {
                step_generation(
                    (src_pos.as_slice(), src_vel.as_slice()),
                    (dst_pos.as_mut_slice(), dst_vel.as_mut_slice()),
                    &inputs,
                    black_box(&tick),
                )
            })
        });
    }
    group.finish();
}

fn bench_software_frame(c: &mut Criterion) {
    let settings = RenderSettings {
        width: 160,
        height: 120,
        ..RenderSettings::default()
    };
    let particles = ParticleConfig {
        max_particles: 16384,
        grid_width: 128,
        ..ParticleConfig::default()
    };
    let maps = EnvironmentMaps::procedural(64, TerrainParams::default());
    let backend = SoftwareBackend::new(settings.width, settings.height);
    let mut pipeline = Pipeline::initialize(backend, &settings, &particles, &maps).unwrap();

    c.bench_function("software_tick", |b| {
        b.iter(|| pipeline.tick(black_box(1.0 / 60.0)).unwrap())
    });
}

criterion_group!(benches, bench_birth_times, bench_step_generation, bench_software_frame);
criterion_main!(benches);
