//! Headless wgpu backend.
//!
//! Runs the WGSL techniques of [`crate::effect`] on a real device with no
//! window: the backbuffer is an offscreen texture that can be copied back
//! with [`RenderBackend::read_backbuffer`]. Every clear and draw is encoded
//! and submitted on its own, and device errors are caught with error scopes
//! so they come back as `Result`s instead of panics.

mod technique;

use std::collections::HashMap;

use tracing::{debug, info, trace};

use crate::backend::{
    ClearValues, DeviceCaps, DrawCall, HudText, ParamValue, PixelFormat, RenderBackend,
    RenderTargetDesc, RenderTargetId, TechniqueId, TextureDesc, TextureDimension, TextureId,
};
use crate::config::{ColorFormat, RenderSettings};
use crate::effect::{self, DepthMode};
use crate::error::{AllocationError, FrameError, SetupError};

use technique::GpuTechnique;

/// Depth format shared by every depth attachment.
pub(crate) const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

const BACKBUFFER: TextureId = TextureId(0);

pub(crate) fn to_wgpu_format(format: PixelFormat) -> wgpu::TextureFormat {
    match format {
        PixelFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        PixelFormat::R32Float => wgpu::TextureFormat::R32Float,
        PixelFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        PixelFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        PixelFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        PixelFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
    }
}

/// Run `f` inside validation and out-of-memory error scopes.
fn scoped<T>(device: &wgpu::Device, f: impl FnOnce() -> T) -> Result<T, String> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = f();
    let validation = pollster::block_on(device.pop_error_scope());
    let oom = pollster::block_on(device.pop_error_scope());
    match validation.or(oom) {
        Some(err) => Err(err.to_string()),
        None => Ok(value),
    }
}

struct GpuTexture {
    desc: TextureDesc,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

/// [`RenderBackend`] on a headless wgpu device.
pub struct WgpuBackend {
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    caps: DeviceCaps,
    backbuffer_format: PixelFormat,
    textures: HashMap<u32, GpuTexture>,
    targets: HashMap<u32, RenderTargetDesc>,
    techniques: Vec<GpuTechnique>,
    bound: Option<RenderTargetId>,
    next_id: u32,
    hud: Vec<HudText>,
}

impl WgpuBackend {
    /// Bring up a device and an offscreen backbuffer.
    pub fn new(settings: &RenderSettings) -> Result<Self, SetupError> {
        pollster::block_on(Self::new_async(settings))
    }

    async fn new_async(settings: &RenderSettings) -> Result<Self, SetupError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| SetupError::Backend("No compatible GPU adapter found".to_string()))?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .map_err(|e| SetupError::Backend(e.to_string()))?;

        let downlevel = adapter.get_downlevel_capabilities();
        #[allow(unreachable_patterns)]
        let max_shader_model = match downlevel.shader_model {
            wgpu::ShaderModel::Sm2 => 2,
            wgpu::ShaderModel::Sm4 => 4,
            wgpu::ShaderModel::Sm5 => 5,
            _ => 5,
        };
        let caps = DeviceCaps {
            max_shader_model,
            max_simultaneous_rts: device.limits().max_color_attachments,
        };

        let info = adapter.get_info();
        info!(
            target: "gpu",
            adapter = %info.name,
            backend = ?info.backend,
            shader_model = caps.max_shader_model,
            max_rts = caps.max_simultaneous_rts,
            "wgpu device ready"
        );

        let backbuffer_format = match settings.color_format {
            ColorFormat::Rgba8 => PixelFormat::Rgba8Unorm,
            ColorFormat::Rgba8Srgb => PixelFormat::Rgba8UnormSrgb,
        };

        let mut backend = Self {
            adapter,
            device,
            queue,
            caps,
            backbuffer_format,
            textures: HashMap::new(),
            targets: HashMap::new(),
            techniques: Vec::new(),
            bound: None,
            next_id: 1,
            hud: Vec::new(),
        };
        backend
            .resize_backbuffer(settings.width, settings.height)
            .map_err(SetupError::Allocation)?;
        Ok(backend)
    }

    /// Text drawn since the last backbuffer clear.
    pub fn hud(&self) -> &[HudText] {
        &self.hud
    }

    fn allocate(&self, desc: &TextureDesc, usage: wgpu::TextureUsages) -> Result<GpuTexture, String> {
        let (dimension, depth) = match desc.dimension {
            TextureDimension::D2 => (wgpu::TextureDimension::D2, 1),
            TextureDimension::D3 => (wgpu::TextureDimension::D3, desc.depth),
        };
        let texture = scoped(&self.device, || {
            self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some(&desc.label),
                size: wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: depth,
                },
                mip_level_count: desc.mip_levels,
                sample_count: 1,
                dimension,
                format: to_wgpu_format(desc.format),
                usage,
                view_formats: &[],
            })
        })?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(GpuTexture {
            desc: desc.clone(),
            texture,
            view,
        })
    }

    fn renderable(&self, format: PixelFormat) -> bool {
        self.adapter
            .get_texture_format_features(to_wgpu_format(format))
            .allowed_usages
            .contains(wgpu::TextureUsages::RENDER_ATTACHMENT)
    }

    fn attachments(&self) -> Result<(Vec<TextureId>, Option<TextureId>), FrameError> {
        match self.bound {
            None => Ok((vec![BACKBUFFER], None)),
            Some(target) => self
                .targets
                .get(&target.0)
                .map(|desc| (desc.colors.clone(), desc.depth))
                .ok_or_else(|| FrameError::Backend(format!("render target {} is not live", target.0))),
        }
    }

    fn view(&self, id: TextureId) -> Result<&wgpu::TextureView, FrameError> {
        self.textures
            .get(&id.0)
            .map(|t| &t.view)
            .ok_or_else(|| FrameError::Backend(format!("texture {} is not live", id.0)))
    }
}

impl RenderBackend for WgpuBackend {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn probe_render_target(
        &mut self,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<(), AllocationError> {
        if !self.renderable(format) {
            return Err(AllocationError::RenderTarget {
                label: "probe".to_string(),
                reason: format!("{:?} cannot be rendered to on this adapter", format),
            });
        }
        let desc = TextureDesc::d2("probe", width, height, format);
        self.allocate(
            &desc,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        )
        .map(drop)
        .map_err(|reason| AllocationError::RenderTarget {
            label: "probe".to_string(),
            reason,
        })
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, AllocationError> {
        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST;
        if desc.format.is_depth() {
            usage = wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING;
        } else if desc.dimension == TextureDimension::D2 {
            usage |= wgpu::TextureUsages::COPY_SRC;
            if self.renderable(desc.format) {
                usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
            }
        }

        let texture = self.allocate(desc, usage).map_err(|reason| AllocationError::Texture {
            label: desc.label.clone(),
            reason,
        })?;
        let id = self.next_id;
        self.next_id += 1;
        self.textures.insert(id, texture);
        trace!(target: "gpu", id, label = %desc.label, "texture created");
        Ok(TextureId(id))
    }

    fn write_texture(&mut self, texture: TextureId, data: &[u8]) -> Result<(), AllocationError> {
        let tex = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| AllocationError::Upload {
                reason: format!("texture {} is not live", texture.0),
            })?;
        let desc = &tex.desc;
        if data.len() != desc.byte_size() || desc.format.is_depth() {
            return Err(AllocationError::Upload {
                reason: format!(
                    "'{}' expects {} bytes of {:?}, got {}",
                    desc.label,
                    desc.byte_size(),
                    desc.format,
                    data.len()
                ),
            });
        }

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &tex.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(desc.width * desc.format.bytes_per_texel()),
                rows_per_image: Some(desc.height),
            },
            wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.depth,
            },
        );
        Ok(())
    }

    fn release_texture(&mut self, texture: TextureId) {
        if texture == BACKBUFFER {
            return;
        }
        if let Some(tex) = self.textures.remove(&texture.0) {
            tex.texture.destroy();
            trace!(target: "gpu", id = texture.0, "texture released");
        }
    }

    fn texture_size(&self, texture: TextureId) -> Option<(u32, u32, u32)> {
        self.textures
            .get(&texture.0)
            .map(|t| (t.desc.width, t.desc.height, t.desc.depth))
    }

    fn create_render_target(
        &mut self,
        desc: &RenderTargetDesc,
    ) -> Result<RenderTargetId, AllocationError> {
        let fail = |reason: String| AllocationError::RenderTarget {
            label: desc.label.clone(),
            reason,
        };
        if desc.colors.is_empty() {
            return Err(fail("no color attachments".to_string()));
        }
        if desc.colors.len() > self.caps.max_simultaneous_rts as usize {
            return Err(fail(format!(
                "{} color attachments exceed the device limit of {}",
                desc.colors.len(),
                self.caps.max_simultaneous_rts
            )));
        }
        for id in desc.colors.iter().chain(desc.depth.iter()) {
            let tex = self
                .textures
                .get(&id.0)
                .filter(|_| *id != BACKBUFFER)
                .ok_or_else(|| fail(format!("texture {} is not live", id.0)))?;
            if !tex.texture.usage().contains(wgpu::TextureUsages::RENDER_ATTACHMENT) {
                return Err(fail(format!("'{}' cannot be rendered to", tex.desc.label)));
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        self.targets.insert(id, desc.clone());
        trace!(target: "gpu", id, label = %desc.label, "render target created");
        Ok(RenderTargetId(id))
    }

    fn release_render_target(&mut self, target: RenderTargetId) {
        if self.targets.remove(&target.0).is_some() && self.bound == Some(target) {
            self.bound = None;
        }
    }

    fn bind_render_target(&mut self, target: Option<RenderTargetId>) -> Result<(), FrameError> {
        if let Some(t) = target {
            if !self.targets.contains_key(&t.0) {
                return Err(FrameError::Backend(format!("render target {} is not live", t.0)));
            }
        }
        self.bound = target;
        Ok(())
    }

    fn clear(&mut self, values: &ClearValues) -> Result<(), FrameError> {
        let (colors, depth) = self.attachments()?;
        let color_views = colors
            .iter()
            .map(|id| self.view(*id))
            .collect::<Result<Vec<_>, _>>()?;
        let depth_view = depth.map(|id| self.view(id)).transpose()?;

        let color_load = match values.color {
            Some(c) => wgpu::LoadOp::Clear(wgpu::Color {
                r: c[0] as f64,
                g: c[1] as f64,
                b: c[2] as f64,
                a: c[3] as f64,
            }),
            None => wgpu::LoadOp::Load,
        };
        let depth_load = match values.depth {
            Some(d) => wgpu::LoadOp::Clear(d),
            None => wgpu::LoadOp::Load,
        };

        scoped(&self.device, || {
            let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Clear Encoder"),
            });
            {
                let attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = color_views
                    .iter()
                    .map(|view| {
                        Some(wgpu::RenderPassColorAttachment {
                            view,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load: color_load,
                                store: wgpu::StoreOp::Store,
                            },
                        })
                    })
                    .collect();
                let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("Clear Pass"),
                    color_attachments: &attachments,
                    depth_stencil_attachment: depth_view.map(|view| {
                        wgpu::RenderPassDepthStencilAttachment {
                            view,
                            depth_ops: Some(wgpu::Operations {
                                load: depth_load,
                                store: wgpu::StoreOp::Store,
                            }),
                            stencil_ops: None,
                        }
                    }),
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
            }
            self.queue.submit(std::iter::once(encoder.finish()));
        })
        .map_err(FrameError::Backend)?;

        if self.bound.is_none() {
            self.hud.clear();
        }
        Ok(())
    }

    fn resize_backbuffer(&mut self, width: u32, height: u32) -> Result<(), AllocationError> {
        let desc = TextureDesc::d2("backbuffer", width, height, self.backbuffer_format);
        let texture = self
            .allocate(
                &desc,
                wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC,
            )
            .map_err(|reason| AllocationError::Texture {
                label: desc.label.clone(),
                reason,
            })?;
        if let Some(old) = self.textures.insert(BACKBUFFER.0, texture) {
            old.texture.destroy();
        }
        debug!(target: "gpu", width, height, "backbuffer resized");
        Ok(())
    }

    fn load_technique(&mut self, name: &str) -> Result<TechniqueId, AllocationError> {
        if let Some(i) = self.techniques.iter().position(|t| t.def.name == name) {
            return Ok(TechniqueId(i as u32));
        }
        let def = effect::technique(name).ok_or_else(|| AllocationError::Technique {
            name: name.to_string(),
            reason: "no such technique".to_string(),
        })?;
        let format = to_wgpu_format(self.backbuffer_format);
        let technique = scoped(&self.device, || GpuTechnique::new(&self.device, def, format))
            .map_err(|reason| AllocationError::Technique {
                name: name.to_string(),
                reason,
            })?;
        self.techniques.push(technique);
        debug!(target: "gpu", technique = name, "technique compiled");
        Ok(TechniqueId(self.techniques.len() as u32 - 1))
    }

    fn set_param(
        &mut self,
        technique: TechniqueId,
        name: &str,
        value: ParamValue,
    ) -> Result<(), FrameError> {
        self.techniques
            .get_mut(technique.0 as usize)
            .ok_or_else(|| FrameError::Backend(format!("technique {} is not loaded", technique.0)))?
            .set(name, value)
            .map_err(FrameError::Backend)
    }

    fn draw(&mut self, call: &DrawCall) -> Result<(), FrameError> {
        let (colors, depth) = self.attachments()?;
        let tech = self
            .techniques
            .get(call.technique.0 as usize)
            .ok_or_else(|| FrameError::Backend(format!("technique {} is not loaded", call.technique.0)))?;
        if call.topology != tech.def.topology {
            return Err(FrameError::Backend(format!(
                "{} draws {:?}, got {:?}",
                tech.def.name, tech.def.topology, call.topology
            )));
        }

        let inputs = tech.bound_textures().map_err(FrameError::Backend)?;
        for tex in &inputs {
            if colors.contains(tex) || depth == Some(*tex) {
                return Err(FrameError::Hazard {
                    technique: tech.def.name.to_string(),
                    texture: tex.0,
                });
            }
        }

        let views = inputs
            .iter()
            .map(|id| self.view(*id))
            .collect::<Result<Vec<_>, _>>()?;
        let color_views = colors
            .iter()
            .map(|id| self.view(*id))
            .collect::<Result<Vec<_>, _>>()?;
        let depth_view = match tech.def.depth {
            DepthMode::None => None,
            DepthMode::ReadWrite | DepthMode::ReadOnly => Some(
                depth
                    .map(|id| self.view(id))
                    .transpose()?
                    .ok_or_else(|| {
                        FrameError::Backend(format!("{} needs a depth attachment", tech.def.name))
                    })?,
            ),
        };

        tech.upload(&self.queue);
        scoped(&self.device, || {
            let bind_group = tech.bind_group(&self.device, &views);
            let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(tech.def.name),
            });
            {
                let attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = color_views
                    .iter()
                    .map(|view| {
                        Some(wgpu::RenderPassColorAttachment {
                            view,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load: wgpu::LoadOp::Load,
                                store: wgpu::StoreOp::Store,
                            },
                        })
                    })
                    .collect();
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some(tech.def.name),
                    color_attachments: &attachments,
                    depth_stencil_attachment: depth_view.map(|view| {
                        wgpu::RenderPassDepthStencilAttachment {
                            view,
                            depth_ops: Some(wgpu::Operations {
                                load: wgpu::LoadOp::Load,
                                store: wgpu::StoreOp::Store,
                            }),
                            stencil_ops: None,
                        }
                    }),
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                pass.set_pipeline(tech.pipeline());
                pass.set_bind_group(0, &bind_group, &[]);
                pass.draw(0..call.vertex_count, 0..call.instance_count);
            }
            self.queue.submit(std::iter::once(encoder.finish()));
        })
        .map_err(FrameError::Backend)?;

        trace!(
            target: "gpu",
            technique = tech.def.name,
            vertices = call.vertex_count,
            instances = call.instance_count,
            "draw"
        );
        Ok(())
    }

    fn draw_text(&mut self, x: f32, y: f32, color: [f32; 4], text: &str) {
        trace!(target: "gpu", x, y, text, "overlay text");
        self.hud.push(HudText {
            x,
            y,
            color,
            text: text.to_string(),
        });
    }

    fn read_backbuffer(&mut self) -> Result<image::RgbaImage, FrameError> {
        let bb = self
            .textures
            .get(&BACKBUFFER.0)
            .ok_or_else(|| FrameError::Backend("backbuffer missing".to_string()))?;
        let width = bb.desc.width;
        let height = bb.desc.height;
        let unpadded = width * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let bytes_per_row = unpadded.div_ceil(align) * align;

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Backbuffer Readback"),
            size: (bytes_per_row * height) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Readback Encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &bb.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(FrameError::Backend(e.to_string())),
            Err(e) => return Err(FrameError::Backend(e.to_string())),
        }

        let mut pixels = Vec::with_capacity((unpadded * height) as usize);
        {
            let data = slice.get_mapped_range();
            for row in 0..height {
                let start = (row * bytes_per_row) as usize;
                pixels.extend_from_slice(&data[start..start + unpadded as usize]);
            }
        }
        buffer.unmap();

        image::RgbaImage::from_raw(width, height, pixels)
            .ok_or_else(|| FrameError::Backend("backbuffer size mismatch".to_string()))
    }
}
