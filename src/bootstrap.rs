//! One-time device capability check.
//!
//! [`confirm_device`] runs before the pipeline allocates anything. A device
//! that fails it is rejected outright; there is no reduced-quality path.

use tracing::{info, warn};

use crate::backend::{DeviceCaps, PixelFormat, RenderBackend};
use crate::error::CapabilityError;

/// Lowest accepted shader model.
pub const MIN_SHADER_MODEL: u8 = 3;

/// The update pass writes position and velocity at once.
pub const MIN_RENDER_TARGETS: u32 = 2;

/// Side length of the trial render targets.
pub const PROBE_SIZE: u32 = 256;

/// Formats that must be renderable: particle state and birth times.
pub const REQUIRED_FORMATS: [PixelFormat; 2] = [PixelFormat::Rgba32Float, PixelFormat::R32Float];

/// What the check found.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReport {
    pub backend: String,
    pub caps: DeviceCaps,
    pub formats: Vec<PixelFormat>,
}

/// Check shader model, attachment count and render-target formats.
pub fn confirm_device<B: RenderBackend + ?Sized>(backend: &mut B) -> Result<DeviceReport, CapabilityError> {
    let caps = backend.caps();

    if caps.max_shader_model < MIN_SHADER_MODEL {
        warn!(target: "bootstrap", found = caps.max_shader_model, "shader model too low");
        return Err(CapabilityError::ShaderModel {
            required: MIN_SHADER_MODEL,
            found: caps.max_shader_model,
        });
    }
    if caps.max_simultaneous_rts < MIN_RENDER_TARGETS {
        warn!(target: "bootstrap", found = caps.max_simultaneous_rts, "too few render targets");
        return Err(CapabilityError::RenderTargets {
            required: MIN_RENDER_TARGETS,
            found: caps.max_simultaneous_rts,
        });
    }
    for format in REQUIRED_FORMATS {
        if let Err(err) = backend.probe_render_target(format, PROBE_SIZE, PROBE_SIZE) {
            warn!(target: "bootstrap", ?format, %err, "format probe failed");
            return Err(CapabilityError::Format {
                format,
                reason: err.to_string(),
            });
        }
    }

    info!(
        target: "bootstrap",
        backend = backend.name(),
        shader_model = caps.max_shader_model,
        max_rts = caps.max_simultaneous_rts,
        "device accepted"
    );
    Ok(DeviceReport {
        backend: backend.name().to_string(),
        caps,
        formats: REQUIRED_FORMATS.to_vec(),
    })
}
