//! Run the particle system without a window and save the last frame.
//!
//! Run with: cargo run --example headless -- [frames] [output.png]
//!
//! Settings come from `gpups.toml` when it exists, then from `GPUPS_*`
//! environment variables. `RUST_LOG=gpups=debug` shows every pass.

use std::error::Error;

use gpups::prelude::*;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let frames: u32 = args.next().map(|s| s.parse()).transpose()?.unwrap_or(240);
    let output = args.next().unwrap_or_else(|| "frame.png".to_string());

    let mut config = AppConfig::load_or_default("gpups.toml")?;
    config.apply_env_overrides();
    config.validate()?;

    let settings = config.render_settings();
    let maps = config.environment_maps()?;
    let backend = create_backend(&settings)?;
    let mut pipeline = Pipeline::initialize(backend, &settings, &config.particles, &maps)?;

    // Orbit slowly so the fog and terrain are seen from a few angles.
    let dt = 1.0 / 60.0;
    for i in 0..frames {
        let angle = i as f32 * dt * 0.2;
        pipeline.camera_mut().eye = Vec3::new(-1.7 * angle.cos(), 2.2, -1.7 * angle.sin());

        let status = pipeline.tick(dt)?;
        if status.wrapped {
            tracing::info!(cycles = status.cycles, "emission cycle wrapped");
        }
        if status.frame % 60 == 0 {
            tracing::info!(
                frame = status.frame,
                accumulated = status.accumulated_time,
                fps = status.fps,
                "tick"
            );
        }
    }

    let image = pipeline.capture()?;
    image.save(&output)?;
    tracing::info!(path = %output, "saved final frame");

    pipeline.shutdown();
    Ok(())
}
