//! End-to-end tests of the pipeline on the software backend.
//!
//! These drive `initialize`, `tick`, `on_resize` and `shutdown` the way a
//! host would and inspect the backend afterwards: live resources, the
//! command log, and the texels of the particle state.

use gpups::backend::software::{Command, SoftwareBackend};
use gpups::backend::{
    ClearValues, DeviceCaps, DrawCall, HudText, ParamValue, PixelFormat, RenderBackend,
    RenderTargetDesc, RenderTargetId, TechniqueId, TextureDesc, TextureId,
};
use gpups::effect;
use gpups::environment::{EnvironmentMaps, TerrainParams};
use gpups::error::{AllocationError, CapabilityError, ConfigurationError, FrameError, SetupError};
use gpups::pipeline::{HUD_COLOR, HUD_LINE_HEIGHT, SKY_COLOR};
use gpups::state::SENTINEL_POSITION;
use gpups::{AbortSignal, ParticleConfig, PassStage, Pipeline, RenderSettings};

// ============================================================================
// Helpers
// ============================================================================

fn settings(width: u32, height: u32) -> RenderSettings {
    RenderSettings {
        width,
        height,
        ..RenderSettings::default()
    }
}

fn maps() -> EnvironmentMaps {
    EnvironmentMaps::flat(16, TerrainParams::default())
}

/// 16 slots in a 4x4 grid, one birth every 0.1 s, a 1.6 s cycle.
fn small_particles() -> ParticleConfig {
    ParticleConfig {
        max_particles: 16,
        grid_width: 4,
        emit_frequency: 10.0,
        noise_size: 4,
        ..ParticleConfig::default()
    }
}

fn live_slots(backend: &SoftwareBackend, texture: TextureId) -> Vec<usize> {
    backend
        .texels(texture)
        .expect("position texture is live")
        .iter()
        .enumerate()
        .filter(|(_, t)| t[3] > 0.0)
        .map(|(i, _)| i)
        .collect()
}

// ============================================================================
// End to end
// ============================================================================

#[test]
fn test_first_tick_births_the_first_two_slots() {
    let mut backend = SoftwareBackend::new(32, 24);
    let particles = ParticleConfig {
        max_particles: 65536,
        grid_width: 256,
        emit_frequency: 500.0,
        ..ParticleConfig::default()
    };
    let mut pipeline = Pipeline::initialize(&mut backend, &settings(32, 24), &particles, &maps()).unwrap();

    let status = pipeline.tick(0.002).unwrap();
    assert_eq!(status.frame, 1);
    assert_eq!(status.accumulated_time, 0.002);
    assert!(!status.wrapped);
    assert_eq!(pipeline.stage(), Some(PassStage::FinalBlend));

    let system = pipeline.system().unwrap();
    let written = system.pos_texture();
    let previous = system.next().position;
    let backend = pipeline.backend();

    let texels = backend.texels(written).unwrap();
    assert_eq!(texels.len(), 65536);
    assert_eq!(live_slots(backend, written), vec![0, 1]);
    assert!(texels[2..].iter().all(|t| *t == SENTINEL_POSITION));

    // The generation the step read from is untouched.
    assert!(backend
        .texels(previous)
        .unwrap()
        .iter()
        .all(|t| *t == SENTINEL_POSITION));
    assert_eq!(backend.particles_drawn(), 2);
}

#[test]
fn test_spawned_particles_start_at_the_emitter() {
    let mut backend = SoftwareBackend::new(16, 16);
    let particles = small_particles();
    let mut pipeline = Pipeline::initialize(&mut backend, &settings(16, 16), &particles, &maps()).unwrap();
    pipeline.tick(0.0).unwrap();

    let pos = pipeline.system().unwrap().pos_texture();
    let texel = pipeline.backend().texels(pos).unwrap()[0];
    assert_eq!(texel, [0.0, 0.7, 0.0, 8.0]);
}

#[test]
fn test_particles_fall_and_age() {
    let mut backend = SoftwareBackend::new(16, 16);
    let mut pipeline =
        Pipeline::initialize(&mut backend, &settings(16, 16), &small_particles(), &maps()).unwrap();
    pipeline.tick(0.0).unwrap();
    for _ in 0..5 {
        pipeline.tick(0.01).unwrap();
    }

    let pos = pipeline.system().unwrap().pos_texture();
    let texel = pipeline.backend().texels(pos).unwrap()[0];
    assert!((texel[3] - (8.0 - 0.05)).abs() < 1e-4);
    assert!(texel[1] > 0.0);
}

#[test]
fn test_wraparound_recycles_slots() {
    let mut backend = SoftwareBackend::new(16, 16);
    let mut pipeline =
        Pipeline::initialize(&mut backend, &settings(16, 16), &small_particles(), &maps()).unwrap();

    let first = pipeline.tick(0.8).unwrap();
    assert!(!first.wrapped);
    let pos = pipeline.system().unwrap().pos_texture();
    assert_eq!(live_slots(pipeline.backend(), pos), (0..=8).collect::<Vec<_>>());

    // Exactly one full cycle: the accumulator resets and only slot 0 is alive.
    let second = pipeline.tick(0.8).unwrap();
    assert!(second.wrapped);
    assert_eq!(second.accumulated_time, 0.0);
    assert_eq!(second.cycles, 1);
    let pos = pipeline.system().unwrap().pos_texture();
    assert_eq!(live_slots(pipeline.backend(), pos), vec![0]);
}

#[test]
fn test_hud_text_drawn_on_backbuffer() {
    let mut backend = SoftwareBackend::new(16, 16);
    let mut pipeline =
        Pipeline::initialize(&mut backend, &settings(16, 16), &small_particles(), &maps()).unwrap();
    pipeline.tick(1.0 / 60.0).unwrap();

    let hud = pipeline.backend().hud_lines();
    assert_eq!(hud.len(), 2);
    assert_eq!(hud[0], "GPU Particle System");
    assert!(hud[1].starts_with("FPS: "));
}

#[test]
fn test_hud_is_yellow_at_the_top_left() {
    let mut backend = SoftwareBackend::new(16, 16);
    let mut pipeline =
        Pipeline::initialize(&mut backend, &settings(16, 16), &small_particles(), &maps()).unwrap();
    pipeline.tick(1.0 / 60.0).unwrap();

    let hud = pipeline.backend().hud();
    assert_eq!(
        hud[0],
        HudText {
            x: 0.0,
            y: 0.0,
            color: [1.0, 1.0, 0.0, 1.0],
            text: "GPU Particle System".to_string(),
        }
    );
    assert_eq!((hud[1].x, hud[1].y), (0.0, HUD_LINE_HEIGHT));
    assert_eq!(HUD_LINE_HEIGHT, 18.0);
    assert_eq!(hud[1].color, HUD_COLOR);
}

#[test]
fn test_capture_matches_viewport() {
    let mut backend = SoftwareBackend::new(24, 12);
    let mut pipeline =
        Pipeline::initialize(&mut backend, &settings(24, 12), &small_particles(), &maps()).unwrap();
    pipeline.tick(0.1).unwrap();
    let frame = pipeline.capture().unwrap();
    assert_eq!(frame.dimensions(), (24, 12));
    assert!(frame.pixels().all(|p| p[3] == 255));
}

// ============================================================================
// Pass ordering and hazards
// ============================================================================

#[test]
fn test_pass_order_of_a_frame() {
    let mut backend = SoftwareBackend::new(16, 16);
    let mut pipeline =
        Pipeline::initialize(&mut backend, &settings(16, 16), &small_particles(), &maps()).unwrap();
    pipeline.backend_mut().take_commands();
    pipeline.tick(0.1).unwrap();

    let targets = pipeline.targets().unwrap().clone();
    let generation = pipeline.system().unwrap().current().target;
    let commands = pipeline.backend_mut().take_commands();

    let scene = Some(targets.scene());
    let fog = Some(targets.fog());
    assert_eq!(
        &commands[..11],
        &[
            Command::Bind(scene),
            Command::Clear { target: scene, values: ClearValues::all(SKY_COLOR) },
            Command::Draw { technique: effect::TERRAIN, target: scene, instances: 1 },
            Command::Bind(Some(generation)),
            Command::Draw { technique: effect::UPDATE, target: Some(generation), instances: 1 },
            Command::Bind(fog),
            Command::Clear { target: fog, values: ClearValues::all([0.0; 4]) },
            Command::Draw { technique: effect::PARTICLES, target: fog, instances: 16 },
            Command::Bind(None),
            Command::Clear { target: None, values: ClearValues::all(SKY_COLOR) },
            Command::Draw { technique: effect::BLEND, target: None, instances: 1 },
        ]
    );
    assert!(matches!(&commands[11], Command::Text(t) if t == "GPU Particle System"));
}

#[test]
fn test_fog_clear_resets_shared_depth() {
    let mut backend = SoftwareBackend::new(16, 16);
    let mut pipeline =
        Pipeline::initialize(&mut backend, &settings(16, 16), &small_particles(), &maps()).unwrap();
    pipeline.backend_mut().take_commands();
    pipeline.tick(0.1).unwrap();

    let targets = pipeline.targets().unwrap().clone();
    let fog_clear = pipeline
        .backend()
        .commands()
        .iter()
        .find_map(|c| match c {
            Command::Clear { target, values } if *target == Some(targets.fog()) => Some(*values),
            _ => None,
        })
        .expect("fog target is cleared every frame");
    assert_eq!(fog_clear.color, Some([0.0; 4]));
    assert_eq!(fog_clear.depth, Some(1.0));
}

#[test]
fn test_backbuffer_cleared_to_sky_color() {
    let mut backend = SoftwareBackend::new(16, 16);
    let mut pipeline =
        Pipeline::initialize(&mut backend, &settings(16, 16), &small_particles(), &maps()).unwrap();
    pipeline.backend_mut().take_commands();
    pipeline.tick(0.1).unwrap();

    let backbuffer_clear = pipeline.backend().commands().iter().find_map(|c| match c {
        Command::Clear { target: None, values } => Some(*values),
        _ => None,
    });
    assert_eq!(backbuffer_clear, Some(ClearValues::all(SKY_COLOR)));
}

#[test]
fn test_update_alternates_generations() {
    let mut backend = SoftwareBackend::new(16, 16);
    let mut pipeline =
        Pipeline::initialize(&mut backend, &settings(16, 16), &small_particles(), &maps()).unwrap();
    pipeline.backend_mut().take_commands();
    for _ in 0..6 {
        pipeline.tick(0.05).unwrap();
    }

    let update_targets: Vec<_> = pipeline
        .backend()
        .commands()
        .iter()
        .filter_map(|c| match c {
            Command::Draw { technique, target, .. } if *technique == effect::UPDATE => *target,
            _ => None,
        })
        .collect();
    assert_eq!(update_targets.len(), 6);
    for pair in update_targets.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }
    assert_eq!(update_targets[0], update_targets[2]);
}

// ============================================================================
// Setup failures
// ============================================================================

#[test]
fn test_invalid_frequency_rejected_before_device_check() {
    let mut backend = SoftwareBackend::new(16, 16).with_caps(DeviceCaps {
        max_shader_model: 1,
        max_simultaneous_rts: 1,
    });
    let particles = ParticleConfig {
        emit_frequency: 0.0,
        ..small_particles()
    };
    let err = Pipeline::initialize(&mut backend, &settings(16, 16), &particles, &maps())
        .err()
        .unwrap();
    assert!(matches!(
        err,
        SetupError::Configuration(ConfigurationError::InvalidFrequency(_))
    ));
}

#[test]
fn test_zero_viewport_rejected() {
    let mut backend = SoftwareBackend::new(16, 16);
    let err = Pipeline::initialize(&mut backend, &settings(0, 16), &small_particles(), &maps())
        .err()
        .unwrap();
    assert!(matches!(
        err,
        SetupError::Configuration(ConfigurationError::InvalidViewport { .. })
    ));
}

#[test]
fn test_capability_gate_allocates_nothing() {
    for (shader_model, rts) in [(2, 8), (5, 1)] {
        let mut backend = SoftwareBackend::new(16, 16).with_caps(DeviceCaps {
            max_shader_model: shader_model,
            max_simultaneous_rts: rts,
        });
        let err = Pipeline::initialize(&mut backend, &settings(16, 16), &small_particles(), &maps())
            .err()
            .unwrap();
        assert!(matches!(err, SetupError::Unsupported(_)));
        assert_eq!(backend.live_textures(), 0);
        assert!(backend.commands().is_empty());
    }
}

#[test]
fn test_missing_float_target_format_is_unsupported() {
    let mut backend = SoftwareBackend::new(16, 16).with_unsupported_format(PixelFormat::Rgba32Float);
    let err = Pipeline::initialize(&mut backend, &settings(16, 16), &small_particles(), &maps())
        .err()
        .unwrap();
    assert!(matches!(
        err,
        SetupError::Unsupported(CapabilityError::Format {
            format: PixelFormat::Rgba32Float,
            ..
        })
    ));
    assert_eq!(backend.live_textures(), 0);
}

#[test]
fn test_allocation_failure_leaves_nothing_behind() {
    // 3 environment + 6 particle state + 3 viewport textures in total.
    for budget in [0, 2, 4, 8, 10, 11] {
        let mut backend = SoftwareBackend::new(16, 16).with_texture_budget(budget);
        let err = Pipeline::initialize(&mut backend, &settings(16, 16), &small_particles(), &maps())
            .err()
            .unwrap();
        assert!(
            matches!(err, SetupError::Allocation(AllocationError::Texture { .. })),
            "budget {}: {}",
            budget,
            err
        );
        assert_eq!(backend.live_textures(), 0, "budget {}", budget);
        assert_eq!(backend.live_render_targets(), 0, "budget {}", budget);
    }
}

#[test]
fn test_exact_budget_is_enough() {
    let mut backend = SoftwareBackend::new(16, 16).with_texture_budget(12);
    assert!(Pipeline::initialize(&mut backend, &settings(16, 16), &small_particles(), &maps()).is_ok());
}

// ============================================================================
// Resize
// ============================================================================

#[test]
fn test_resize_rebuilds_viewport_targets() {
    let mut backend = SoftwareBackend::new(32, 24);
    let mut pipeline =
        Pipeline::initialize(&mut backend, &settings(32, 24), &small_particles(), &maps()).unwrap();
    pipeline.tick(0.1).unwrap();
    let old = pipeline.targets().unwrap().clone();
    let live_before = pipeline.backend().live_textures();

    pipeline.on_resize(40, 30).unwrap();

    let targets = pipeline.targets().unwrap().clone();
    assert_eq!(targets.size(), (40, 30));
    for texture in targets.textures() {
        assert_eq!(pipeline.backend().texture_size(texture), Some((40, 30, 1)));
    }
    for texture in old.textures() {
        assert_eq!(pipeline.backend().texture_size(texture), None);
    }
    assert_eq!(pipeline.backend().live_textures(), live_before);
    assert_eq!(pipeline.backend().live_render_targets(), 4);
    assert_eq!(pipeline.settings().width, 40);

    pipeline.tick(0.1).unwrap();
    assert_eq!(pipeline.capture().unwrap().dimensions(), (40, 30));
}

#[test]
fn test_resize_to_zero_keeps_old_targets() {
    let mut backend = SoftwareBackend::new(32, 24);
    let mut pipeline =
        Pipeline::initialize(&mut backend, &settings(32, 24), &small_particles(), &maps()).unwrap();
    let old = pipeline.targets().unwrap().clone();

    let err = pipeline.on_resize(0, 30).unwrap_err();
    assert!(matches!(err, SetupError::Configuration(_)));
    assert_eq!(pipeline.targets(), Some(&old));
    assert!(pipeline.tick(0.1).is_ok());
}

#[test]
fn test_failed_resize_keeps_the_old_viewport() {
    // Exactly enough textures for setup, none spare for new viewport targets.
    let mut backend = SoftwareBackend::new(32, 24).with_texture_budget(12);
    let mut pipeline =
        Pipeline::initialize(&mut backend, &settings(32, 24), &small_particles(), &maps()).unwrap();
    pipeline.tick(0.1).unwrap();
    let old = pipeline.targets().unwrap().clone();
    let live_before = pipeline.backend().live_textures();

    let err = pipeline.on_resize(40, 30).unwrap_err();
    assert!(matches!(err, SetupError::Allocation(AllocationError::Texture { .. })));

    assert_eq!(pipeline.targets(), Some(&old));
    for texture in old.textures() {
        assert_eq!(pipeline.backend().texture_size(texture), Some((32, 24, 1)));
    }
    assert_eq!(pipeline.backend().live_textures(), live_before);
    assert_eq!(pipeline.backend().live_render_targets(), 4);
    assert_eq!((pipeline.settings().width, pipeline.settings().height), (32, 24));
    assert_eq!(pipeline.capture().unwrap().dimensions(), (32, 24));

    pipeline.tick(0.1).unwrap();
    assert_eq!(pipeline.capture().unwrap().dimensions(), (32, 24));
}

// ============================================================================
// Emission frequency
// ============================================================================

#[test]
fn test_invalid_emit_frequency_keeps_the_schedule() {
    let mut backend = SoftwareBackend::new(16, 16);
    let mut pipeline =
        Pipeline::initialize(&mut backend, &settings(16, 16), &small_particles(), &maps()).unwrap();
    pipeline.tick(0.25).unwrap();

    for frequency in [0.0, f32::NAN, -5.0] {
        let err = pipeline.set_emit_frequency(frequency).unwrap_err();
        assert!(
            matches!(err, SetupError::Configuration(ConfigurationError::InvalidFrequency(_))),
            "{}: {}",
            frequency,
            err
        );
    }

    let system = pipeline.system().unwrap();
    assert_eq!(system.schedule().frequency(), 10.0);
    assert_eq!(system.schedule().accumulated(), 0.25);
    let births = pipeline.backend().texels(system.birth_time_texture()).unwrap();
    for (i, texel) in births.iter().enumerate() {
        assert!((texel[0] - i as f32 / 10.0).abs() < 1e-6, "slot {}", i);
    }
}

#[test]
fn test_new_emit_frequency_rescales_birth_times() {
    let mut backend = SoftwareBackend::new(16, 16);
    let mut pipeline =
        Pipeline::initialize(&mut backend, &settings(16, 16), &small_particles(), &maps()).unwrap();

    pipeline.set_emit_frequency(20.0).unwrap();

    let system = pipeline.system().unwrap();
    assert_eq!(system.schedule().frequency(), 20.0);
    assert_eq!(system.schedule().cycle_length(), 0.8);
    let births = pipeline.backend().texels(system.birth_time_texture()).unwrap();
    for (i, texel) in births.iter().enumerate() {
        assert!((texel[0] - i as f32 / 20.0).abs() < 1e-6, "slot {}", i);
    }

    // Births at 0, 0.05 and 0.1 have happened; 0.15 has not.
    pipeline.tick(0.12).unwrap();
    let pos = pipeline.system().unwrap().pos_texture();
    assert_eq!(live_slots(pipeline.backend(), pos), vec![0, 1, 2]);
}

// ============================================================================
// Abort
// ============================================================================

/// Raises the abort signal right after the update draw has been recorded.
struct AbortDuringUpdate {
    inner: SoftwareBackend,
    signal: Option<AbortSignal>,
}

impl RenderBackend for AbortDuringUpdate {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn caps(&self) -> DeviceCaps {
        self.inner.caps()
    }

    fn probe_render_target(
        &mut self,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<(), AllocationError> {
        self.inner.probe_render_target(format, width, height)
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, AllocationError> {
        self.inner.create_texture(desc)
    }

    fn write_texture(&mut self, texture: TextureId, data: &[u8]) -> Result<(), AllocationError> {
        self.inner.write_texture(texture, data)
    }

    fn release_texture(&mut self, texture: TextureId) {
        self.inner.release_texture(texture)
    }

    fn texture_size(&self, texture: TextureId) -> Option<(u32, u32, u32)> {
        self.inner.texture_size(texture)
    }

    fn create_render_target(
        &mut self,
        desc: &RenderTargetDesc,
    ) -> Result<RenderTargetId, AllocationError> {
        self.inner.create_render_target(desc)
    }

    fn release_render_target(&mut self, target: RenderTargetId) {
        self.inner.release_render_target(target)
    }

    fn bind_render_target(&mut self, target: Option<RenderTargetId>) -> Result<(), FrameError> {
        self.inner.bind_render_target(target)
    }

    fn clear(&mut self, values: &ClearValues) -> Result<(), FrameError> {
        self.inner.clear(values)
    }

    fn resize_backbuffer(&mut self, width: u32, height: u32) -> Result<(), AllocationError> {
        self.inner.resize_backbuffer(width, height)
    }

    fn load_technique(&mut self, name: &str) -> Result<TechniqueId, AllocationError> {
        self.inner.load_technique(name)
    }

    fn set_param(
        &mut self,
        technique: TechniqueId,
        name: &str,
        value: ParamValue,
    ) -> Result<(), FrameError> {
        self.inner.set_param(technique, name, value)
    }

    fn draw(&mut self, call: &DrawCall) -> Result<(), FrameError> {
        self.inner.draw(call)?;
        let was_update = matches!(
            self.inner.commands().last(),
            Some(Command::Draw { technique, .. }) if *technique == effect::UPDATE
        );
        if let (true, Some(signal)) = (was_update, &self.signal) {
            signal.raise();
        }
        Ok(())
    }

    fn draw_text(&mut self, x: f32, y: f32, color: [f32; 4], text: &str) {
        self.inner.draw_text(x, y, color, text)
    }

    fn read_backbuffer(&mut self) -> Result<image::RgbaImage, FrameError> {
        self.inner.read_backbuffer()
    }
}

#[test]
fn test_abort_mid_tick_discards_the_write() {
    let backend = AbortDuringUpdate {
        inner: SoftwareBackend::new(16, 16),
        signal: None,
    };
    let mut pipeline = Pipeline::initialize(backend, &settings(16, 16), &small_particles(), &maps()).unwrap();
    let signal = pipeline.abort_signal();
    pipeline.backend_mut().signal = Some(signal.clone());

    let before = *pipeline.system().unwrap().current();
    let err = pipeline.tick(0.5).unwrap_err();
    assert!(matches!(err, FrameError::Aborted));
    assert_eq!(pipeline.stage(), Some(PassStage::Terrain));
    assert_eq!(pipeline.clock().frame(), 0);

    // No swap: the readable generation is the same and still all sentinel.
    let system = pipeline.system().unwrap();
    assert_eq!(*system.current(), before);
    assert_eq!(system.schedule().accumulated(), 0.0);
    assert!(pipeline
        .backend()
        .inner
        .texels(before.position)
        .unwrap()
        .iter()
        .all(|t| *t == SENTINEL_POSITION));

    // The signal stays raised until the host clears it.
    assert!(matches!(pipeline.tick(0.5), Err(FrameError::Aborted)));

    pipeline.backend_mut().signal = None;
    signal.clear();
    let status = pipeline.tick(0.5).unwrap();
    assert_eq!(status.frame, 1);
    assert_eq!(status.accumulated_time, 0.5);
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn test_shutdown_releases_everything() {
    let mut backend = SoftwareBackend::new(16, 16);
    let mut pipeline =
        Pipeline::initialize(&mut backend, &settings(16, 16), &small_particles(), &maps()).unwrap();
    pipeline.tick(0.1).unwrap();

    pipeline.shutdown();
    assert!(pipeline.is_shut_down());
    assert!(matches!(pipeline.tick(0.1), Err(FrameError::ShutDown)));
    pipeline.shutdown();

    drop(pipeline);
    assert_eq!(backend.live_textures(), 0);
    assert_eq!(backend.live_render_targets(), 0);
}

#[test]
fn test_drop_releases_everything() {
    let mut backend = SoftwareBackend::new(16, 16);
    {
        let mut pipeline =
            Pipeline::initialize(&mut backend, &settings(16, 16), &small_particles(), &maps()).unwrap();
        pipeline.tick(0.1).unwrap();
    }
    assert_eq!(backend.live_textures(), 0);
    assert_eq!(backend.live_render_targets(), 0);
}

#[test]
fn test_boxed_backend_from_settings() {
    let settings = settings(16, 16);
    let backend = gpups::create_backend(&settings).unwrap();
    let mut pipeline = Pipeline::initialize(backend, &settings, &small_particles(), &maps()).unwrap();
    assert_eq!(pipeline.device().backend, "software");
    assert!(pipeline.tick(0.1).is_ok());
}
