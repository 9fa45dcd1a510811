//! Error types for the particle pipeline.
//!
//! Setup-time failures (configuration, capability, allocation) are never
//! recovered locally; they surface to the host through [`SetupError`].
//! Per-tick failures surface through [`FrameError`].

use std::fmt;

use crate::backend::PixelFormat;

/// Invalid particle or viewport configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    /// Emission frequency was zero, negative or not finite.
    InvalidFrequency(f32),
    /// The particle count was zero.
    NoParticles,
    /// The slot grid width was zero.
    InvalidGridWidth(u32),
    /// `width * ceil(max_particles / width)` does not fit in a `u32`.
    GridTooLarge { max_particles: u32, width: u32 },
    /// The viewport had a zero dimension.
    InvalidViewport { width: u32, height: u32 },
    /// A numeric setting was out of its valid range.
    InvalidValue { name: &'static str, value: f32 },
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationError::InvalidFrequency(freq) => {
                write!(f, "Emission frequency must be a positive finite number, got {}", freq)
            }
            ConfigurationError::NoParticles => write!(f, "Particle count must be greater than zero"),
            ConfigurationError::InvalidGridWidth(w) => {
                write!(f, "Slot grid width must be greater than zero, got {}", w)
            }
            ConfigurationError::GridTooLarge { max_particles, width } => write!(
                f,
                "Slot grid for {} particles at width {} has too many slots",
                max_particles, width
            ),
            ConfigurationError::InvalidViewport { width, height } => {
                write!(f, "Viewport must have non-zero dimensions, got {}x{}", width, height)
            }
            ConfigurationError::InvalidValue { name, value } => {
                write!(f, "Invalid value for '{}': {}", name, value)
            }
        }
    }
}

impl std::error::Error for ConfigurationError {}

/// The backend cannot run this pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityError {
    /// Shader model below the required level.
    ShaderModel { required: u8, found: u8 },
    /// Not enough simultaneous render targets.
    RenderTargets { required: u32, found: u32 },
    /// A required pixel format cannot be used as a render target.
    Format { format: PixelFormat, reason: String },
}

impl fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityError::ShaderModel { required, found } => write!(
                f,
                "Shader model {} required, device supports {}",
                required, found
            ),
            CapabilityError::RenderTargets { required, found } => write!(
                f,
                "{} simultaneous render targets required, device supports {}",
                required, found
            ),
            CapabilityError::Format { format, reason } => {
                write!(f, "Render target format {:?} unsupported: {}", format, reason)
            }
        }
    }
}

impl std::error::Error for CapabilityError {}

/// A texture, render target or technique could not be created.
#[derive(Debug, Clone, PartialEq)]
pub enum AllocationError {
    /// Texture creation failed.
    Texture { label: String, reason: String },
    /// Render-target creation failed.
    RenderTarget { label: String, reason: String },
    /// Technique lookup or compilation failed.
    Technique { name: String, reason: String },
    /// Texel upload was rejected (size mismatch, unknown handle).
    Upload { reason: String },
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationError::Texture { label, reason } => {
                write!(f, "Failed to create texture '{}': {}", label, reason)
            }
            AllocationError::RenderTarget { label, reason } => {
                write!(f, "Failed to create render target '{}': {}", label, reason)
            }
            AllocationError::Technique { name, reason } => {
                write!(f, "Failed to load technique '{}': {}", name, reason)
            }
            AllocationError::Upload { reason } => write!(f, "Failed to upload texels: {}", reason),
        }
    }
}

impl std::error::Error for AllocationError {}

/// Errors that abort pipeline construction.
#[derive(Debug)]
pub enum SetupError {
    /// Invalid configuration.
    Configuration(ConfigurationError),
    /// Backend lacks a required capability.
    Unsupported(CapabilityError),
    /// Resource creation failed.
    Allocation(AllocationError),
    /// Backend could not be brought up at all.
    Backend(String),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupError::Configuration(e) => write!(f, "Configuration error: {}", e),
            SetupError::Unsupported(e) => write!(f, "Backend cannot run this pipeline: {}", e),
            SetupError::Allocation(e) => write!(f, "Resource allocation failed: {}", e),
            SetupError::Backend(msg) => write!(f, "Backend initialization failed: {}", msg),
        }
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SetupError::Configuration(e) => Some(e),
            SetupError::Unsupported(e) => Some(e),
            SetupError::Allocation(e) => Some(e),
            SetupError::Backend(_) => None,
        }
    }
}

impl From<ConfigurationError> for SetupError {
    fn from(e: ConfigurationError) -> Self {
        SetupError::Configuration(e)
    }
}

impl From<CapabilityError> for SetupError {
    fn from(e: CapabilityError) -> Self {
        SetupError::Unsupported(e)
    }
}

impl From<AllocationError> for SetupError {
    fn from(e: AllocationError) -> Self {
        SetupError::Allocation(e)
    }
}

/// Errors that abandon a single tick.
#[derive(Debug)]
pub enum FrameError {
    /// The host abandoned the frame; the generation write was discarded.
    Aborted,
    /// A draw would sample a texture attached to the bound render target.
    Hazard { technique: String, texture: u32 },
    /// The backend failed to execute a command.
    Backend(String),
    /// Resources could not be rebuilt (resize).
    Allocation(AllocationError),
    /// The pipeline was used after `shutdown`.
    ShutDown,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Aborted => write!(f, "Frame aborted by host"),
            FrameError::Hazard { technique, texture } => write!(
                f,
                "Technique '{}' samples texture {} while it is bound for writing",
                technique, texture
            ),
            FrameError::Backend(msg) => write!(f, "Backend error: {}", msg),
            FrameError::Allocation(e) => write!(f, "Resource allocation failed: {}", e),
            FrameError::ShutDown => write!(f, "Pipeline has been shut down"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Allocation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<AllocationError> for FrameError {
    fn from(e: AllocationError) -> Self {
        FrameError::Allocation(e)
    }
}

/// Errors that can occur while loading configuration or assets from disk.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the file.
    Io(std::io::Error),
    /// Failed to parse TOML.
    Parse(toml::de::Error),
    /// Failed to serialize TOML.
    Serialize(toml::ser::Error),
    /// Failed to decode an image.
    Image(image::ImageError),
    /// An image decoded but cannot be used as a terrain map.
    Asset { path: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Serialize(e) => write!(f, "Failed to serialize config: {}", e),
            ConfigError::Image(e) => write!(f, "Failed to load image: {}", e),
            ConfigError::Asset { path, reason } => write!(f, "Unusable asset '{}': {}", path, reason),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Serialize(e) => Some(e),
            ConfigError::Image(e) => Some(e),
            ConfigError::Asset { .. } => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(e: toml::ser::Error) -> Self {
        ConfigError::Serialize(e)
    }
}

impl From<image::ImageError> for ConfigError {
    fn from(e: image::ImageError) -> Self {
        ConfigError::Image(e)
    }
}
