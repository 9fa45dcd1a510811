//! Rendering backend abstraction.
//!
//! The pipeline talks to graphics hardware only through [`RenderBackend`]:
//! textures and render targets are opaque handles, techniques are looked
//! up by name, and parameters are bound by name before each draw. Two
//! implementations ship with the crate:
//!
//! - [`SoftwareBackend`](software::SoftwareBackend) runs every technique on
//!   the CPU. It is deterministic and needs no GPU, which makes it the
//!   backend used by the test suite.
//! - [`WgpuBackend`](crate::gpu::WgpuBackend) runs the WGSL techniques from
//!   [`crate::effect`] on a headless wgpu device.
//!
//! Both reject a draw that samples a texture attached to the bound render
//! target, so read/write hazards surface as [`FrameError::Hazard`] instead
//! of undefined results.

pub mod software;

use glam::{Mat4, Vec2, Vec4};
use serde::{Deserialize, Serialize};

use crate::config::RenderSettings;
use crate::error::{AllocationError, FrameError, SetupError};

/// Opaque texture handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub(crate) u32);

impl TextureId {
    /// Raw handle value, stable for the lifetime of the texture.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Opaque render-target handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderTargetId(pub(crate) u32);

impl RenderTargetId {
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Opaque handle to a loaded technique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TechniqueId(pub(crate) u32);

/// Texel formats the pipeline allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Four 32-bit float channels; particle positions and velocities.
    Rgba32Float,
    /// One 32-bit float channel; birth times and heights.
    R32Float,
    /// Four 16-bit float channels; scene and fog captures.
    Rgba16Float,
    /// Four normalized 8-bit channels; the noise volume and backbuffer.
    Rgba8Unorm,
    /// sRGB-encoded variant of [`PixelFormat::Rgba8Unorm`].
    Rgba8UnormSrgb,
    /// 32-bit float depth.
    Depth32Float,
}

impl PixelFormat {
    /// Size of one texel in bytes.
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            PixelFormat::Rgba32Float => 16,
            PixelFormat::Rgba16Float => 8,
            PixelFormat::R32Float
            | PixelFormat::Rgba8Unorm
            | PixelFormat::Rgba8UnormSrgb
            | PixelFormat::Depth32Float => 4,
        }
    }

    #[inline]
    pub fn is_depth(self) -> bool {
        matches!(self, PixelFormat::Depth32Float)
    }
}

/// Dimensionality of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    D2,
    D3,
}

/// Texture creation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    /// Depth of a 3D texture; 1 for 2D textures.
    pub depth: u32,
    pub mip_levels: u32,
    pub format: PixelFormat,
    pub dimension: TextureDimension,
}

impl TextureDesc {
    /// Single-mip 2D texture.
    pub fn d2(label: impl Into<String>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            label: label.into(),
            width,
            height,
            depth: 1,
            mip_levels: 1,
            format,
            dimension: TextureDimension::D2,
        }
    }

    /// Single-mip 3D texture.
    pub fn d3(label: impl Into<String>, width: u32, height: u32, depth: u32, format: PixelFormat) -> Self {
        Self {
            label: label.into(),
            width,
            height,
            depth,
            mip_levels: 1,
            format,
            dimension: TextureDimension::D3,
        }
    }

    /// Texel count of the top mip level.
    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize * self.depth as usize
    }

    /// Byte size of a full upload of the top mip level.
    pub fn byte_size(&self) -> usize {
        self.texel_count() * self.format.bytes_per_texel() as usize
    }
}

/// Color attachments plus an optional depth attachment.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderTargetDesc {
    pub label: String,
    pub colors: Vec<TextureId>,
    pub depth: Option<TextureId>,
}

/// What the device can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    /// Highest supported shader model (major version).
    pub max_shader_model: u8,
    /// Maximum number of color attachments bound at once.
    pub max_simultaneous_rts: u32,
}

/// A technique parameter value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    Float(f32),
    Vec2(Vec2),
    Vec4(Vec4),
    Mat4(Mat4),
    Texture(TextureId),
}

impl ParamValue {
    /// Scalar value, if this is a float parameter.
    pub fn as_float(&self) -> Option<f32> {
        match *self {
            ParamValue::Float(v) => Some(v),
            _ => None,
        }
    }

    /// Vector value; floats and 2-vectors are widened with zeros.
    pub fn as_vec4(&self) -> Option<Vec4> {
        match *self {
            ParamValue::Float(v) => Some(Vec4::new(v, 0.0, 0.0, 0.0)),
            ParamValue::Vec2(v) => Some(v.extend(0.0).extend(0.0)),
            ParamValue::Vec4(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_mat4(&self) -> Option<Mat4> {
        match *self {
            ParamValue::Mat4(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_texture(&self) -> Option<TextureId> {
        match *self {
            ParamValue::Texture(t) => Some(t),
            _ => None,
        }
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        ParamValue::Float(v)
    }
}

impl From<Vec2> for ParamValue {
    fn from(v: Vec2) -> Self {
        ParamValue::Vec2(v)
    }
}

impl From<Vec4> for ParamValue {
    fn from(v: Vec4) -> Self {
        ParamValue::Vec4(v)
    }
}

impl From<Mat4> for ParamValue {
    fn from(m: Mat4) -> Self {
        ParamValue::Mat4(m)
    }
}

impl From<TextureId> for ParamValue {
    fn from(t: TextureId) -> Self {
        ParamValue::Texture(t)
    }
}

/// Primitive assembly mode of a draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    TriangleList,
    TriangleStrip,
}

/// A non-indexed draw with the given technique.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawCall {
    pub technique: TechniqueId,
    pub vertex_count: u32,
    pub instance_count: u32,
    pub topology: Topology,
}

/// What to clear on the bound render target; `None` keeps contents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearValues {
    pub color: Option<[f32; 4]>,
    pub depth: Option<f32>,
    pub stencil: Option<u32>,
}

impl ClearValues {
    /// Clear color, depth to 1.0 and stencil to 0.
    pub fn all(color: [f32; 4]) -> Self {
        Self {
            color: Some(color),
            depth: Some(1.0),
            stencil: Some(0),
        }
    }

    /// Clear only the color attachments.
    pub fn color(color: [f32; 4]) -> Self {
        Self {
            color: Some(color),
            depth: None,
            stencil: None,
        }
    }
}

/// One line of overlay text and where it was drawn.
#[derive(Debug, Clone, PartialEq)]
pub struct HudText {
    pub x: f32,
    pub y: f32,
    pub color: [f32; 4],
    pub text: String,
}

/// Which backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// CPU reference backend.
    #[default]
    Software,
    /// Headless wgpu device.
    Wgpu,
}

/// Operations the pipeline needs from a graphics device.
///
/// Handles returned by one backend are meaningless to another. Releasing an
/// unknown handle is a no-op.
pub trait RenderBackend {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Device capabilities.
    fn caps(&self) -> DeviceCaps;

    /// Try to create (and immediately drop) a render target of `format`.
    fn probe_render_target(
        &mut self,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<(), AllocationError>;

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, AllocationError>;

    /// Replace the top mip level of a texture with tightly packed texels.
    fn write_texture(&mut self, texture: TextureId, data: &[u8]) -> Result<(), AllocationError>;

    fn release_texture(&mut self, texture: TextureId);

    /// `(width, height, depth)` of a live texture.
    fn texture_size(&self, texture: TextureId) -> Option<(u32, u32, u32)>;

    fn create_render_target(
        &mut self,
        desc: &RenderTargetDesc,
    ) -> Result<RenderTargetId, AllocationError>;

    fn release_render_target(&mut self, target: RenderTargetId);

    /// Bind a render target for subsequent clears and draws; `None` binds
    /// the backbuffer.
    fn bind_render_target(&mut self, target: Option<RenderTargetId>) -> Result<(), FrameError>;

    /// Clear the bound render target.
    fn clear(&mut self, values: &ClearValues) -> Result<(), FrameError>;

    /// Reallocate the backbuffer at a new size.
    fn resize_backbuffer(&mut self, width: u32, height: u32) -> Result<(), AllocationError>;

    /// Look up a technique by name.
    fn load_technique(&mut self, name: &str) -> Result<TechniqueId, AllocationError>;

    /// Set a named parameter of a technique. Values persist across draws.
    fn set_param(
        &mut self,
        technique: TechniqueId,
        name: &str,
        value: ParamValue,
    ) -> Result<(), FrameError>;

    /// Draw into the bound render target.
    fn draw(&mut self, call: &DrawCall) -> Result<(), FrameError>;

    /// Queue a line of overlay text on the backbuffer.
    fn draw_text(&mut self, x: f32, y: f32, color: [f32; 4], text: &str);

    /// Copy the backbuffer to host memory.
    fn read_backbuffer(&mut self) -> Result<image::RgbaImage, FrameError>;
}

impl<B: RenderBackend + ?Sized> RenderBackend for Box<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn caps(&self) -> DeviceCaps {
        (**self).caps()
    }

    fn probe_render_target(
        &mut self,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<(), AllocationError> {
        (**self).probe_render_target(format, width, height)
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, AllocationError> {
        (**self).create_texture(desc)
    }

    fn write_texture(&mut self, texture: TextureId, data: &[u8]) -> Result<(), AllocationError> {
        (**self).write_texture(texture, data)
    }

    fn release_texture(&mut self, texture: TextureId) {
        (**self).release_texture(texture)
    }

    fn texture_size(&self, texture: TextureId) -> Option<(u32, u32, u32)> {
        (**self).texture_size(texture)
    }

    fn create_render_target(
        &mut self,
        desc: &RenderTargetDesc,
    ) -> Result<RenderTargetId, AllocationError> {
        (**self).create_render_target(desc)
    }

    fn release_render_target(&mut self, target: RenderTargetId) {
        (**self).release_render_target(target)
    }

    fn bind_render_target(&mut self, target: Option<RenderTargetId>) -> Result<(), FrameError> {
        (**self).bind_render_target(target)
    }

    fn clear(&mut self, values: &ClearValues) -> Result<(), FrameError> {
        (**self).clear(values)
    }

    fn resize_backbuffer(&mut self, width: u32, height: u32) -> Result<(), AllocationError> {
        (**self).resize_backbuffer(width, height)
    }

    fn load_technique(&mut self, name: &str) -> Result<TechniqueId, AllocationError> {
        (**self).load_technique(name)
    }

    fn set_param(
        &mut self,
        technique: TechniqueId,
        name: &str,
        value: ParamValue,
    ) -> Result<(), FrameError> {
        (**self).set_param(technique, name, value)
    }

    fn draw(&mut self, call: &DrawCall) -> Result<(), FrameError> {
        (**self).draw(call)
    }

    fn draw_text(&mut self, x: f32, y: f32, color: [f32; 4], text: &str) {
        (**self).draw_text(x, y, color, text)
    }

    fn read_backbuffer(&mut self) -> Result<image::RgbaImage, FrameError> {
        (**self).read_backbuffer()
    }
}

impl<B: RenderBackend + ?Sized> RenderBackend for &mut B {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn caps(&self) -> DeviceCaps {
        (**self).caps()
    }

    fn probe_render_target(
        &mut self,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<(), AllocationError> {
        (**self).probe_render_target(format, width, height)
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, AllocationError> {
        (**self).create_texture(desc)
    }

    fn write_texture(&mut self, texture: TextureId, data: &[u8]) -> Result<(), AllocationError> {
        (**self).write_texture(texture, data)
    }

    fn release_texture(&mut self, texture: TextureId) {
        (**self).release_texture(texture)
    }

    fn texture_size(&self, texture: TextureId) -> Option<(u32, u32, u32)> {
        (**self).texture_size(texture)
    }

    fn create_render_target(
        &mut self,
        desc: &RenderTargetDesc,
    ) -> Result<RenderTargetId, AllocationError> {
        (**self).create_render_target(desc)
    }

    fn release_render_target(&mut self, target: RenderTargetId) {
        (**self).release_render_target(target)
    }

    fn bind_render_target(&mut self, target: Option<RenderTargetId>) -> Result<(), FrameError> {
        (**self).bind_render_target(target)
    }

    fn clear(&mut self, values: &ClearValues) -> Result<(), FrameError> {
        (**self).clear(values)
    }

    fn resize_backbuffer(&mut self, width: u32, height: u32) -> Result<(), AllocationError> {
        (**self).resize_backbuffer(width, height)
    }

    fn load_technique(&mut self, name: &str) -> Result<TechniqueId, AllocationError> {
        (**self).load_technique(name)
    }

    fn set_param(
        &mut self,
        technique: TechniqueId,
        name: &str,
        value: ParamValue,
    ) -> Result<(), FrameError> {
        (**self).set_param(technique, name, value)
    }

    fn draw(&mut self, call: &DrawCall) -> Result<(), FrameError> {
        (**self).draw(call)
    }

    fn draw_text(&mut self, x: f32, y: f32, color: [f32; 4], text: &str) {
        (**self).draw_text(x, y, color, text)
    }

    fn read_backbuffer(&mut self) -> Result<image::RgbaImage, FrameError> {
        (**self).read_backbuffer()
    }
}

/// Construct the backend named by the render settings.
pub fn create_backend(settings: &RenderSettings) -> Result<Box<dyn RenderBackend>, SetupError> {
    match settings.backend {
        BackendKind::Software => Ok(Box::new(software::SoftwareBackend::new(
            settings.width,
            settings.height,
        ))),
        BackendKind::Wgpu => Ok(Box::new(crate::gpu::WgpuBackend::new(settings)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texture_desc_sizes() {
        let desc = TextureDesc::d2("pos", 256, 4, PixelFormat::Rgba32Float);
        assert_eq!(desc.texel_count(), 1024);
        assert_eq!(desc.byte_size(), 16 * 1024);

        let vol = TextureDesc::d3("noise", 32, 32, 32, PixelFormat::Rgba8Unorm);
        assert_eq!(vol.byte_size(), 32 * 32 * 32 * 4);
    }

    #[test]
    fn test_param_widening() {
        assert_eq!(ParamValue::from(2.0).as_vec4(), Some(Vec4::new(2.0, 0.0, 0.0, 0.0)));
        assert_eq!(
            ParamValue::from(Vec2::new(1.0, 2.0)).as_vec4(),
            Some(Vec4::new(1.0, 2.0, 0.0, 0.0))
        );
        assert_eq!(ParamValue::from(Mat4::IDENTITY).as_vec4(), None);
        assert_eq!(ParamValue::Texture(TextureId(3)).as_texture(), Some(TextureId(3)));
    }
}
