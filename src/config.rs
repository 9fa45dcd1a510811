//! Application configuration.
//!
//! Settings are read from a TOML file. Every section and key is optional;
//! anything missing takes its default, so an empty file is a valid config.
//!
//! ```toml
//! [context]
//! render_factory = "software"   # or "wgpu"
//!
//! [screen]
//! width = 800
//! height = 600
//! color_fmt = "rgba8"
//! fullscreen = false
//!
//! [octree]
//! depth = 3
//!
//! [particles]
//! max_particles = 65536
//! emit_frequency = 500.0
//!
//! [terrain]
//! extent = 4.0
//! height_scale = 0.5
//! ```
//!
//! Environment variables `GPUPS_RENDER_FACTORY`, `GPUPS_SCREEN_WIDTH`,
//! `GPUPS_SCREEN_HEIGHT` and `GPUPS_EMIT_FREQUENCY` override the file when
//! [`AppConfig::apply_env_overrides`] is called.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use glam::{Mat4, Vec3, Vec4};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::BackendKind;
use crate::environment::{EnvironmentMaps, TerrainParams};
use crate::error::{ConfigError, ConfigurationError};
use crate::grid::{SlotGrid, DEFAULT_GRID_WIDTH};
use crate::simulation::SimulationParams;

/// Backbuffer color format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorFormat {
    #[default]
    Rgba8,
    Rgba8Srgb,
}

/// `[context]`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    pub render_factory: BackendKind,
}

/// `[screen]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenSection {
    pub width: u32,
    pub height: u32,
    pub color_fmt: ColorFormat,
    pub fullscreen: bool,
}

impl Default for ScreenSection {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            color_fmt: ColorFormat::Rgba8,
            fullscreen: false,
        }
    }
}

/// `[octree]`
///
/// Scene-management depth. Nothing in the pipeline culls by octree; the
/// value is parsed and logged so configs shared with other tools stay valid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OctreeSection {
    pub depth: u32,
}

impl Default for OctreeSection {
    fn default() -> Self {
        Self { depth: 3 }
    }
}

/// Side length of the procedural height map when `[assets]` sets none.
pub const DEFAULT_PROCEDURAL_SIZE: u32 = 128;

/// Largest accepted side of the noise volume.
pub const MAX_NOISE_SIZE: u32 = 256;

/// `[assets]`: optional terrain images. Without them the terrain is procedural.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetSection {
    pub height_map: Option<PathBuf>,
    pub normal_map: Option<PathBuf>,
    /// Side length of the procedural height map.
    pub procedural_size: Option<u32>,
}

/// `[particles]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticleConfig {
    /// Number of emitting slots.
    pub max_particles: u32,
    /// Slots per grid row.
    pub grid_width: u32,
    /// Particles emitted per second.
    pub emit_frequency: f32,
    /// Spawn position (xyz, emitter space) and lifetime in seconds (w).
    pub init_pos_life: [f32; 4],
    /// Emitter translation.
    pub emitter_offset: [f32; 3],
    /// Sprite radius in world units.
    pub point_radius: f32,
    pub gravity: f32,
    pub restitution: f32,
    /// Seed for launch velocities and the noise volume.
    pub seed: u64,
    /// Side length of the noise volume.
    pub noise_size: u32,
}

impl Default for ParticleConfig {
    fn default() -> Self {
        Self {
            max_particles: 65536,
            grid_width: DEFAULT_GRID_WIDTH,
            emit_frequency: 500.0,
            init_pos_life: [0.0, 0.0, 0.0, 8.0],
            emitter_offset: [0.0, 0.7, 0.0],
            point_radius: 0.1,
            gravity: 9.8,
            restitution: 0.5,
            seed: 607,
            noise_size: 32,
        }
    }
}

impl ParticleConfig {
    /// Check every value and size the slot grid.
    pub fn validate(&self) -> Result<SlotGrid, ConfigurationError> {
        let grid = SlotGrid::new(self.max_particles, self.grid_width)?;
        if !self.emit_frequency.is_finite() || self.emit_frequency <= 0.0 {
            return Err(ConfigurationError::InvalidFrequency(self.emit_frequency));
        }
        let life = self.init_pos_life[3];
        if !life.is_finite() || life <= 0.0 {
            return Err(ConfigurationError::InvalidValue {
                name: "init_pos_life.w",
                value: life,
            });
        }
        for (name, value) in [
            ("point_radius", self.point_radius),
            ("gravity", self.gravity),
            ("restitution", self.restitution),
        ] {
            if !value.is_finite() {
                return Err(ConfigurationError::InvalidValue { name, value });
            }
        }
        if self.point_radius <= 0.0 {
            return Err(ConfigurationError::InvalidValue {
                name: "point_radius",
                value: self.point_radius,
            });
        }
        if self.restitution < 0.0 {
            return Err(ConfigurationError::InvalidValue {
                name: "restitution",
                value: self.restitution,
            });
        }
        if self.noise_size == 0 || self.noise_size > MAX_NOISE_SIZE {
            return Err(ConfigurationError::InvalidValue {
                name: "noise_size",
                value: self.noise_size as f32,
            });
        }
        Ok(grid)
    }

    /// Kernel constants derived from this config.
    pub fn simulation_params(&self) -> SimulationParams {
        SimulationParams {
            init_pos_life: Vec4::from_array(self.init_pos_life),
            model: Mat4::from_translation(Vec3::from_array(self.emitter_offset)),
            gravity: self.gravity,
            restitution: self.restitution,
        }
    }
}

/// Settings a backend needs to come up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderSettings {
    pub backend: BackendKind,
    pub width: u32,
    pub height: u32,
    pub color_format: ColorFormat,
    pub full_screen: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        AppConfig::default().render_settings()
    }
}

impl RenderSettings {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigurationError::InvalidViewport {
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }
}

/// Complete configuration file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub context: ContextSection,
    pub screen: ScreenSection,
    pub octree: OctreeSection,
    pub particles: ParticleConfig,
    pub terrain: TerrainParams,
    pub assets: AssetSection,
}

impl AppConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load `path`, or fall back to defaults when the file does not exist.
    ///
    /// A file that exists but fails to parse is still an error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            info!(target: "config", path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let config = Self::from_toml_file(path)?;
        info!(target: "config", path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn save_toml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Override selected values from `GPUPS_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("GPUPS_RENDER_FACTORY") {
            match val.to_ascii_lowercase().as_str() {
                "software" => self.context.render_factory = BackendKind::Software,
                "wgpu" => self.context.render_factory = BackendKind::Wgpu,
                other => warn!(target: "config", value = other, "unknown render factory override"),
            }
        }
        if let Ok(val) = env::var("GPUPS_SCREEN_WIDTH") {
            if let Ok(width) = val.parse() {
                self.screen.width = width;
            }
        }
        if let Ok(val) = env::var("GPUPS_SCREEN_HEIGHT") {
            if let Ok(height) = val.parse() {
                self.screen.height = height;
            }
        }
        if let Ok(val) = env::var("GPUPS_EMIT_FREQUENCY") {
            if let Ok(freq) = val.parse() {
                self.particles.emit_frequency = freq;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.render_settings().validate()?;
        self.particles.validate()?;
        for (name, value) in [
            ("terrain.extent", self.terrain.extent),
            ("terrain.height_scale", self.terrain.height_scale),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigurationError::InvalidValue { name, value });
            }
        }
        Ok(())
    }

    /// Terrain maps from `[assets]`, or procedural hills without a height map.
    pub fn environment_maps(&self) -> Result<EnvironmentMaps, ConfigError> {
        match &self.assets.height_map {
            Some(height) => {
                EnvironmentMaps::from_files(height, self.assets.normal_map.as_ref(), self.terrain)
            }
            None => Ok(EnvironmentMaps::procedural(
                self.assets.procedural_size.unwrap_or(DEFAULT_PROCEDURAL_SIZE),
                self.terrain,
            )),
        }
    }

    pub fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            backend: self.context.render_factory,
            width: self.screen.width,
            height: self.screen.height,
            color_format: self.screen.color_fmt,
            full_screen: self.screen.fullscreen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.screen.width, 800);
        assert_eq!(config.screen.height, 600);
        assert_eq!(config.octree.depth, 3);
        assert_eq!(config.context.render_factory, BackendKind::Software);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(AppConfig::from_toml_str("").unwrap(), AppConfig::default());
    }

    #[test]
    fn test_partial_sections() {
        let config = AppConfig::from_toml_str(
            r#"
            [context]
            render_factory = "wgpu"

            [screen]
            width = 1024
            color_fmt = "rgba8_srgb"

            [particles]
            emit_frequency = 250.0
            "#,
        )
        .unwrap();
        assert_eq!(config.context.render_factory, BackendKind::Wgpu);
        assert_eq!(config.screen.width, 1024);
        assert_eq!(config.screen.height, 600);
        assert_eq!(config.screen.color_fmt, ColorFormat::Rgba8Srgb);
        assert_eq!(config.particles.emit_frequency, 250.0);
        assert_eq!(config.particles.max_particles, 65536);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = AppConfig::default();
        let text = toml::to_string(&config).unwrap();
        assert_eq!(AppConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.particles.emit_frequency = 0.0;
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::InvalidFrequency(0.0))
        );

        let mut config = AppConfig::default();
        config.screen.height = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidViewport { .. })
        ));

        let mut config = AppConfig::default();
        config.particles.max_particles = 0;
        assert_eq!(config.validate(), Err(ConfigurationError::NoParticles));
    }

    #[test]
    fn test_noise_size_is_bounded() {
        let mut particles = ParticleConfig::default();
        for size in [0, MAX_NOISE_SIZE + 1, 2000] {
            particles.noise_size = size;
            assert_eq!(
                particles.validate().map(|_| ()),
                Err(ConfigurationError::InvalidValue {
                    name: "noise_size",
                    value: size as f32,
                })
            );
        }
        particles.noise_size = MAX_NOISE_SIZE;
        assert!(particles.validate().is_ok());
    }

    #[test]
    fn test_simulation_params_from_config() {
        let params = ParticleConfig::default().simulation_params();
        assert_eq!(params, SimulationParams::default());
    }

    #[test]
    fn test_procedural_environment_by_default() {
        let maps = AppConfig::default().environment_maps().unwrap();
        assert_eq!(maps.height.width(), DEFAULT_PROCEDURAL_SIZE);
        assert_eq!(maps.terrain, TerrainParams::default());
    }

    #[test]
    fn test_missing_height_map_file() {
        let mut config = AppConfig::default();
        config.assets.height_map = Some(PathBuf::from("does/not/exist.png"));
        assert!(config.environment_maps().is_err());
    }

    #[test]
    fn test_unknown_render_factory_fails_to_parse() {
        let err = AppConfig::from_toml_str("[context]\nrender_factory = \"d3d9\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
