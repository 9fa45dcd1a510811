//! Render pipelines built from [`TechniqueDef`]s.

use crate::backend::{ParamValue, TextureDimension, TextureId, Topology};
use crate::effect::{BlendMode, DepthMode, TargetFormat, TechniqueDef, UniformKind};

use super::{to_wgpu_format, DEPTH_FORMAT};

/// A compiled technique and its current parameter values.
pub(crate) struct GpuTechnique {
    pub def: &'static TechniqueDef,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    uniform_buffer: Option<wgpu::Buffer>,
    /// Packed uniform block, one entry per `vec4` slot.
    uniforms: Vec<[f32; 4]>,
    /// Texture bound at binding `i + 1`.
    textures: Vec<Option<TextureId>>,
}

impl GpuTechnique {
    pub fn new(
        device: &wgpu::Device,
        def: &'static TechniqueDef,
        backbuffer_format: wgpu::TextureFormat,
    ) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(def.name),
            source: wgpu::ShaderSource::Wgsl(def.wgsl().into()),
        });

        let mut entries = Vec::with_capacity(def.textures.len() + 1);
        if !def.uniforms.is_empty() {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }
        for (i, slot) in def.textures.iter().enumerate() {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: i as u32 + 1,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension: match slot.dimension {
                        TextureDimension::D2 => wgpu::TextureViewDimension::D2,
                        TextureDimension::D3 => wgpu::TextureViewDimension::D3,
                    },
                    multisampled: false,
                },
                count: None,
            });
        }

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(def.name),
            entries: &entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(def.name),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let blend = match def.blend {
            BlendMode::Replace => None,
            BlendMode::Alpha => Some(wgpu::BlendState::ALPHA_BLENDING),
        };
        let targets: Vec<Option<wgpu::ColorTargetState>> = def
            .targets
            .iter()
            .map(|t| {
                Some(wgpu::ColorTargetState {
                    format: match t {
                        TargetFormat::Fixed(f) => to_wgpu_format(*f),
                        TargetFormat::Backbuffer => backbuffer_format,
                    },
                    blend,
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();

        let depth_stencil = match def.depth {
            DepthMode::None => None,
            DepthMode::ReadWrite | DepthMode::ReadOnly => Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: def.depth == DepthMode::ReadWrite,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
        };

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(def.name),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &targets,
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: match def.topology {
                    Topology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
                    Topology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
                },
                cull_mode: None,
                ..Default::default()
            },
            depth_stencil,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let slots = def.uniform_slots();
        let uniform_buffer = (slots > 0).then(|| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(def.name),
                size: (slots * 16) as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });

        Self {
            def,
            pipeline,
            bind_group_layout,
            uniform_buffer,
            uniforms: vec![[0.0; 4]; slots],
            textures: vec![None; def.textures.len()],
        }
    }

    /// Store a parameter value; it is uploaded on the next draw.
    pub fn set(&mut self, name: &str, value: ParamValue) -> Result<(), String> {
        if let Some((kind, slot)) = self.def.uniform(name) {
            match (kind, value) {
                (UniformKind::Float, ParamValue::Float(v)) => self.uniforms[slot] = [v, 0.0, 0.0, 0.0],
                (UniformKind::Vec4, v) if v.as_vec4().is_some() => {
                    self.uniforms[slot] = v.as_vec4().unwrap_or_default().to_array();
                }
                (UniformKind::Mat4, ParamValue::Mat4(m)) => {
                    self.uniforms[slot..slot + 4].copy_from_slice(&m.to_cols_array_2d());
                }
                (kind, value) => {
                    return Err(format!(
                        "{}: '{}' expects {:?}, got {:?}",
                        self.def.name, name, kind, value
                    ))
                }
            }
            return Ok(());
        }

        if let Some(binding) = self.def.texture_binding(name) {
            let ParamValue::Texture(texture) = value else {
                return Err(format!("{}: '{}' expects a texture", self.def.name, name));
            };
            self.textures[binding as usize - 1] = Some(texture);
            return Ok(());
        }

        Err(format!("{} has no parameter '{}'", self.def.name, name))
    }

    /// Textures in binding order; every texture parameter must be set.
    pub fn bound_textures(&self) -> Result<Vec<TextureId>, String> {
        self.def
            .textures
            .iter()
            .zip(&self.textures)
            .map(|(slot, tex)| {
                tex.ok_or_else(|| format!("{}: parameter '{}' not set", self.def.name, slot.name))
            })
            .collect()
    }

    pub fn upload(&self, queue: &wgpu::Queue) {
        if let Some(buffer) = &self.uniform_buffer {
            queue.write_buffer(buffer, 0, bytemuck::cast_slice(&self.uniforms));
        }
    }

    /// Bind group for `views`, given in binding order.
    pub fn bind_group(&self, device: &wgpu::Device, views: &[&wgpu::TextureView]) -> wgpu::BindGroup {
        let mut entries = Vec::with_capacity(views.len() + 1);
        if let Some(buffer) = &self.uniform_buffer {
            entries.push(wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            });
        }
        for (i, view) in views.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: wgpu::BindingResource::TextureView(view),
            });
        }
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(self.def.name),
            layout: &self.bind_group_layout,
            entries: &entries,
        })
    }

    #[inline]
    pub fn pipeline(&self) -> &wgpu::RenderPipeline {
        &self.pipeline
    }
}
