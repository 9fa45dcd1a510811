//! CPU reference backend.
//!
//! Runs the four techniques of [`crate::effect`] natively: `Update` through
//! the reference kernel in [`crate::simulation`], the draw techniques
//! through a small triangle rasterizer. Every texel is stored as
//! `[f32; 4]` regardless of its declared format.
//!
//! The backend records every bind, clear, draw and text command so tests
//! can check pass ordering, and can be configured to report weaker
//! capabilities or to fail allocations.

use std::collections::HashMap;

use glam::{Mat4, Vec2, Vec3, Vec4};
use tracing::{debug, trace};

use super::{
    ClearValues, DeviceCaps, DrawCall, HudText, ParamValue, PixelFormat, RenderBackend,
    RenderTargetDesc, RenderTargetId, TechniqueId, TextureDesc, TextureId,
};
use crate::effect::{self, param, TechniqueDef};
use crate::emission::EmissionTick;
use crate::environment::{Ground, TerrainParams};
use crate::error::{AllocationError, FrameError};
use crate::grid::TexelGrid;
use crate::simulation::{step_generation, SimulationParams, StepInputs};

const BACKBUFFER: TextureId = TextureId(0);

/// A command the backend executed, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Bind(Option<RenderTargetId>),
    Clear {
        target: Option<RenderTargetId>,
        values: ClearValues,
    },
    Draw {
        technique: &'static str,
        target: Option<RenderTargetId>,
        instances: u32,
    },
    Text(String),
}

#[derive(Debug, Clone)]
struct SoftTexture {
    desc: TextureDesc,
    /// 3D textures stack their slices vertically.
    texels: TexelGrid<[f32; 4]>,
}

impl SoftTexture {
    fn new(desc: TextureDesc) -> Self {
        let texels = TexelGrid::filled(desc.width, desc.height * desc.depth, [0.0; 4]);
        Self { desc, texels }
    }

    fn size(&self) -> (u32, u32) {
        (self.desc.width, self.desc.height)
    }

    fn load(&self, x: i64, y: i64) -> [f32; 4] {
        self.texels.get_clamped(x, y)
    }

    fn load_3d(&self, x: i64, y: i64, z: i64) -> [f32; 4] {
        let h = self.desc.height as i64;
        let z = z.clamp(0, self.desc.depth as i64 - 1);
        self.texels.get_clamped(x, z * h + y.clamp(0, h - 1))
    }
}

#[derive(Debug)]
struct SoftTechnique {
    def: &'static TechniqueDef,
    params: HashMap<&'static str, ParamValue>,
}

/// Parameter snapshot of one draw.
struct DrawParams<'a> {
    def: &'static TechniqueDef,
    values: &'a HashMap<&'static str, ParamValue>,
}

impl DrawParams<'_> {
    fn missing(&self, name: &str) -> FrameError {
        FrameError::Backend(format!(
            "{}: parameter '{}' not set",
            self.def.name, name
        ))
    }

    fn float(&self, name: &str) -> Result<f32, FrameError> {
        self.values
            .get(name)
            .and_then(ParamValue::as_float)
            .ok_or_else(|| self.missing(name))
    }

    fn vec4(&self, name: &str) -> Result<Vec4, FrameError> {
        self.values
            .get(name)
            .and_then(ParamValue::as_vec4)
            .ok_or_else(|| self.missing(name))
    }

    fn mat4(&self, name: &str) -> Result<Mat4, FrameError> {
        self.values
            .get(name)
            .and_then(ParamValue::as_mat4)
            .ok_or_else(|| self.missing(name))
    }

    fn texture(&self, name: &str) -> Result<TextureId, FrameError> {
        self.values
            .get(name)
            .and_then(ParamValue::as_texture)
            .ok_or_else(|| self.missing(name))
    }
}

/// Terrain lookups straight from the height and normal textures.
struct TextureGround<'a> {
    height: &'a SoftTexture,
    normal: &'a SoftTexture,
    terrain: TerrainParams,
}

impl Ground for TextureGround<'_> {
    fn height_at(&self, x: f32, z: f32) -> f32 {
        let (u, v) = self.terrain.uv(x, z);
        self.height.texels.sample_nearest(u, v)[0] * self.terrain.height_scale
    }

    fn normal_at(&self, x: f32, z: f32) -> Vec3 {
        let (u, v) = self.terrain.uv(x, z);
        let n = self.normal.texels.sample_nearest(u, v);
        Vec3::new(n[0], n[1], n[2])
    }
}

/// Headless CPU implementation of [`RenderBackend`].
#[derive(Debug)]
pub struct SoftwareBackend {
    caps: DeviceCaps,
    unsupported_formats: Vec<PixelFormat>,
    texture_budget: Option<usize>,
    textures: HashMap<u32, SoftTexture>,
    targets: HashMap<u32, RenderTargetDesc>,
    techniques: Vec<SoftTechnique>,
    bound: Option<RenderTargetId>,
    next_id: u32,
    commands: Vec<Command>,
    hud: Vec<HudText>,
    particles_drawn: u32,
}

impl SoftwareBackend {
    /// Backend with a `width x height` backbuffer and generous capabilities.
    pub fn new(width: u32, height: u32) -> Self {
        let mut textures = HashMap::new();
        textures.insert(
            BACKBUFFER.0,
            SoftTexture::new(TextureDesc::d2(
                "backbuffer",
                width.max(1),
                height.max(1),
                PixelFormat::Rgba8Unorm,
            )),
        );
        Self {
            caps: DeviceCaps {
                max_shader_model: 5,
                max_simultaneous_rts: 8,
            },
            unsupported_formats: Vec::new(),
            texture_budget: None,
            textures,
            targets: HashMap::new(),
            techniques: Vec::new(),
            bound: None,
            next_id: 1,
            commands: Vec::new(),
            hud: Vec::new(),
            particles_drawn: 0,
        }
    }

    /// Report different device capabilities.
    pub fn with_caps(mut self, caps: DeviceCaps) -> Self {
        self.caps = caps;
        self
    }

    /// Refuse render targets of `format`.
    pub fn with_unsupported_format(mut self, format: PixelFormat) -> Self {
        self.unsupported_formats.push(format);
        self
    }

    /// Fail texture creation once `budget` textures are live.
    pub fn with_texture_budget(mut self, budget: usize) -> Self {
        self.texture_budget = Some(budget);
        self
    }

    /// Live textures, the backbuffer excluded.
    pub fn live_textures(&self) -> usize {
        self.textures.len() - 1
    }

    pub fn live_render_targets(&self) -> usize {
        self.targets.len()
    }

    /// Every command executed so far.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Drain the command log.
    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    /// Texels of a live texture, row-major, 3D slices stacked.
    pub fn texels(&self, texture: TextureId) -> Option<&[[f32; 4]]> {
        self.textures.get(&texture.0).map(|t| t.texels.as_slice())
    }

    /// Text drawn since the last backbuffer clear.
    pub fn hud_lines(&self) -> Vec<&str> {
        self.hud.iter().map(|line| line.text.as_str()).collect()
    }

    /// Placement and color of every HUD line since the last backbuffer clear.
    pub fn hud(&self) -> &[HudText] {
        &self.hud
    }

    /// Live sprites rasterized by the last particle draw.
    pub fn particles_drawn(&self) -> u32 {
        self.particles_drawn
    }

    fn texture(&self, id: TextureId) -> Result<&SoftTexture, FrameError> {
        self.textures
            .get(&id.0)
            .ok_or_else(|| FrameError::Backend(format!("texture {} is not live", id.0)))
    }

    fn take_texture(&mut self, id: TextureId) -> Result<SoftTexture, FrameError> {
        self.textures
            .remove(&id.0)
            .ok_or_else(|| FrameError::Backend(format!("texture {} is not live", id.0)))
    }

    fn put_texture(&mut self, id: TextureId, texture: SoftTexture) {
        self.textures.insert(id.0, texture);
    }

    /// Color and depth attachments of the bound target.
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

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn run_update(&mut self, p: &DrawParams<'_>, colors: &[TextureId]) -> Result<(), FrameError> {
        let [pos_out, vel_out] = colors else {
            return Err(FrameError::Backend(format!(
                "{} needs two color attachments, {} bound",
                p.def.name,
                colors.len()
            )));
        };

        let tick = EmissionTick {
            accumulated: p.float(param::ACCUMULATE_TIME)?,
            elapsed: p.float(param::ELAPSE_TIME)?,
            wrapped: false,
        };
        let physics = p.vec4(param::PHYSICS)?;
        let params = SimulationParams {
            init_pos_life: p.vec4(param::INIT_POS_LIFE)?,
            model: p.mat4(param::MODEL)?,
            gravity: physics.x,
            restitution: physics.y,
        };
        let terrain = p.vec4(param::TERRAIN)?;

        let pos = self.texture(p.texture(param::PARTICLE_POS_TEX)?)?;
        let vel = self.texture(p.texture(param::PARTICLE_VEL_TEX)?)?;
        let birth = self.texture(p.texture(param::PARTICLE_BIRTH_TIME_TEX)?)?;
        let init_vel = self.texture(p.texture(param::PARTICLE_INIT_VEL_TEX)?)?;
        let ground = TextureGround {
            height: self.texture(p.texture(param::HEIGHT_MAP_TEX)?)?,
            normal: self.texture(p.texture(param::NORMAL_MAP_TEX)?)?,
            terrain: TerrainParams {
                extent: terrain.x,
                height_scale: terrain.y,
            },
        };

        let count = pos.texels.as_slice().len();
        for (name, tex) in [("velocity", vel), ("birth time", birth), ("initial velocity", init_vel)] {
            if tex.texels.as_slice().len() != count {
                return Err(FrameError::Backend(format!(
                    "{} texture does not match the position grid",
                    name
                )));
            }
        }
        for out in [pos_out, vel_out] {
            if self.texture(*out)?.texels.as_slice().len() != count {
                return Err(FrameError::Backend(
                    "update target does not match the position grid".to_string(),
                ));
            }
        }

        let birth_times: Vec<f32> = birth.texels.as_slice().iter().map(|t| t[0]).collect();
        let mut new_pos = vec![[0.0; 4]; count];
        let mut new_vel = vec![[0.0; 4]; count];
        let inputs = StepInputs {
            birth_time: &birth_times,
            init_velocity: init_vel.texels.as_slice(),
            ground: &ground,
            params: &params,
        };
        step_generation(
            (pos.texels.as_slice(), vel.texels.as_slice()),
            (&mut new_pos, &mut new_vel),
            &inputs,
            &tick,
        );

        for (id, data) in [(*pos_out, new_pos), (*vel_out, new_vel)] {
            if let Some(tex) = self.textures.get_mut(&id.0) {
                tex.texels.as_mut_slice().copy_from_slice(&data);
            }
        }
        Ok(())
    }

    fn run_terrain(
        &mut self,
        p: &DrawParams<'_>,
        colors: &[TextureId],
        depth: Option<TextureId>,
    ) -> Result<(), FrameError> {
        let view_proj = p.mat4(param::VIEW_PROJ)?;
        let terrain = p.vec4(param::TERRAIN)?;
        let light = p.vec4(param::LIGHT_DIR)?.truncate().normalize_or(Vec3::Y);
        let height_id = p.texture(param::HEIGHT_MAP_TEX)?;
        let normal_id = p.texture(param::NORMAL_MAP_TEX)?;
        let color_id = first_color(p, colors)?;

        let mut color = self.take_texture(color_id)?;
        let mut depth_tex = match depth {
            Some(id) => match self.take_texture(id) {
                Ok(t) => Some(t),
                Err(e) => {
                    self.put_texture(color_id, color);
                    return Err(e);
                }
            },
            None => None,
        };

        let result = (|| -> Result<(), FrameError> {
            let ground = TextureGround {
                height: self.texture(height_id)?,
                normal: self.texture(normal_id)?,
                terrain: TerrainParams {
                    extent: terrain.x,
                    height_scale: terrain.y,
                },
            };
            let res = terrain.z.max(1.0) as u32;
            let viewport = color.size();
            let vertex = |cx: u32, cz: u32| {
                let x = (cx as f32 / res as f32 - 0.5) * terrain.x;
                let z = (cz as f32 / res as f32 - 0.5) * terrain.x;
                Vec3::new(x, ground.height_at(x, z), z)
            };

            for cz in 0..res {
                for cx in 0..res {
                    let quad = [
                        vertex(cx, cz),
                        vertex(cx + 1, cz),
                        vertex(cx, cz + 1),
                        vertex(cx + 1, cz + 1),
                    ];
                    for tri in [[0, 1, 2], [2, 1, 3]] {
                        let world = tri.map(|i| quad[i]);
                        let Some(screen) = project_triangle(&view_proj, world, viewport) else {
                            continue;
                        };
                        rasterize(screen, viewport, |x, y, bary| {
                            let z = interpolate([screen[0].z, screen[1].z, screen[2].z], bary);
                            if let Some(d) = depth_tex.as_mut() {
                                let stored = d.texels.get(x, y)[0];
                                if z >= stored {
                                    return;
                                }
                                d.texels.set(x, y, [z, 0.0, 0.0, 0.0]);
                            }
                            let wx = interpolate([world[0].x, world[1].x, world[2].x], bary);
                            let wz = interpolate([world[0].z, world[1].z, world[2].z], bary);
                            let h = interpolate([world[0].y, world[1].y, world[2].y], bary);
                            let n = ground.normal_at(wx, wz);
                            let diffuse = n.dot(light).max(0.0);
                            let t = (h / terrain.y.max(1e-4)).clamp(0.0, 1.0);
                            let grass = Vec3::new(0.32, 0.5, 0.18);
                            let rock = Vec3::new(0.6, 0.55, 0.45);
                            let rgb = grass.lerp(rock, t) * (0.25 + 0.75 * diffuse);
                            color.texels.set(x, y, rgb.extend(1.0).to_array());
                        });
                    }
                }
            }
            Ok(())
        })();

        self.put_texture(color_id, color);
        if let (Some(id), Some(d)) = (depth, depth_tex) {
            self.put_texture(id, d);
        }
        result
    }

    fn run_particles(
        &mut self,
        p: &DrawParams<'_>,
        colors: &[TextureId],
        depth: Option<TextureId>,
        instances: u32,
    ) -> Result<(), FrameError> {
        let view_proj = p.mat4(param::VIEW_PROJ)?;
        let right = p.vec4(param::CAMERA_RIGHT)?.truncate();
        let up = p.vec4(param::CAMERA_UP)?.truncate();
        let radius = p.float(param::POINT_RADIUS)?;
        let grid_width = (p.vec4(param::GRID)?.x as u32).max(1);
        let pos_id = p.texture(param::PARTICLE_POS_TEX)?;
        let scene_id = p.texture(param::SCENE_TEX)?;
        let noise_id = p.texture(param::NOISE_VOLUME_TEX)?;
        let color_id = first_color(p, colors)?;

        let mut color = self.take_texture(color_id)?;
        let result = (|| -> Result<u32, FrameError> {
            let pos = self.texture(pos_id)?;
            let scene = self.texture(scene_id)?;
            let noise = self.texture(noise_id)?;
            let depth_tex = depth.map(|id| self.texture(id)).transpose()?;
            let viewport = color.size();
            let noise_dims = Vec3::new(
                noise.desc.width as f32,
                noise.desc.height as f32,
                noise.desc.depth as f32,
            );
            let tint = Vec3::new(0.85, 0.9, 1.0);
            let corners = [
                Vec2::new(-1.0, -1.0),
                Vec2::new(1.0, -1.0),
                Vec2::new(-1.0, 1.0),
                Vec2::new(1.0, 1.0),
            ];

            let mut drawn = 0;
            for instance in 0..instances {
                let x = (instance % grid_width) as i64;
                let y = (instance / grid_width) as i64;
                let pos_life = Vec4::from_array(pos.load(x, y));
                if pos_life.w <= 0.0 {
                    continue;
                }
                drawn += 1;

                let center = pos_life.truncate();
                let n = center * 0.5 - (center * 0.5).floor();
                let texel = (n * noise_dims).floor().clamp(Vec3::ZERO, noise_dims - Vec3::ONE);
                let density = noise.load_3d(texel.x as i64, texel.y as i64, texel.z as i64)[3];
                let sprite_alpha = (0.35 + 0.65 * density) * 0.6;

                let world = corners.map(|c| center + (right * c.x + up * c.y) * radius);
                for tri in [[0, 1, 2], [2, 1, 3]] {
                    let Some(screen) = project_triangle(&view_proj, tri.map(|i| world[i]), viewport) else {
                        continue;
                    };
                    let uv = tri.map(|i| corners[i]);
                    rasterize(screen, viewport, |px, py, bary| {
                        let c = uv[0] * bary[0] + uv[1] * bary[1] + uv[2] * bary[2];
                        let r2 = c.dot(c);
                        if r2 > 1.0 {
                            return;
                        }
                        if let Some(d) = depth_tex {
                            let z = interpolate([screen[0].z, screen[1].z, screen[2].z], bary);
                            if z >= d.load(px as i64, py as i64)[0] {
                                return;
                            }
                        }
                        let bg = Vec4::from_array(scene.load(px as i64, py as i64)).truncate();
                        let src = tint.lerp(bg, 0.35);
                        let a = (1.0 - r2) * sprite_alpha;
                        let dst = Vec4::from_array(color.texels.get(px, py));
                        let rgb = src * a + dst.truncate() * (1.0 - a);
                        let alpha = a + dst.w * (1.0 - a);
                        color.texels.set(px, py, rgb.extend(alpha).to_array());
                    });
                }
            }
            Ok(drawn)
        })();

        self.put_texture(color_id, color);
        self.particles_drawn = result?;
        Ok(())
    }

    fn run_blend(&mut self, p: &DrawParams<'_>, colors: &[TextureId]) -> Result<(), FrameError> {
        let scene_id = p.texture(param::SCENE_TEX)?;
        let fog_id = p.texture(param::FOG_TEX)?;
        let color_id = first_color(p, colors)?;

        let mut color = self.take_texture(color_id)?;
        let result = (|| -> Result<(), FrameError> {
            let scene = self.texture(scene_id)?;
            let fog = self.texture(fog_id)?;
            let (w, h) = color.size();
            for y in 0..h {
                for x in 0..w {
                    let s = Vec4::from_array(scene.load(x as i64, y as i64));
                    let f = Vec4::from_array(fog.load(x as i64, y as i64));
                    let a = f.w.clamp(0.0, 1.0);
                    let rgb = s.truncate() * (1.0 - a) + f.truncate();
                    color.texels.set(x, y, rgb.extend(1.0).to_array());
                }
            }
            Ok(())
        })();
        self.put_texture(color_id, color);
        result
    }
}

fn first_color(p: &DrawParams<'_>, colors: &[TextureId]) -> Result<TextureId, FrameError> {
    colors.first().copied().ok_or_else(|| {
        FrameError::Backend(format!("{} needs a color attachment", p.def.name))
    })
}

/// Screen-space vertex: pixel x, pixel y, NDC depth.
fn project_triangle(view_proj: &Mat4, world: [Vec3; 3], (w, h): (u32, u32)) -> Option<[Vec3; 3]> {
    let mut out = [Vec3::ZERO; 3];
    for (o, p) in out.iter_mut().zip(world) {
        let clip = *view_proj * p.extend(1.0);
        if clip.w <= 1e-5 {
            return None;
        }
        let ndc = clip.truncate() / clip.w;
        if !(0.0..=1.0).contains(&ndc.z) {
            return None;
        }
        *o = Vec3::new(
            (ndc.x * 0.5 + 0.5) * w as f32,
            (0.5 - ndc.y * 0.5) * h as f32,
            ndc.z,
        );
    }
    Some(out)
}

#[inline]
fn interpolate(v: [f32; 3], bary: [f32; 3]) -> f32 {
    v[0] * bary[0] + v[1] * bary[1] + v[2] * bary[2]
}

/// Visit the pixels whose centers fall inside a screen-space triangle.
fn rasterize(v: [Vec3; 3], (w, h): (u32, u32), mut f: impl FnMut(u32, u32, [f32; 3])) {
    let edge = |a: Vec3, b: Vec3, x: f32, y: f32| (b.x - a.x) * (y - a.y) - (b.y - a.y) * (x - a.x);
    let area = edge(v[0], v[1], v[2].x, v[2].y);
    if area.abs() < 1e-12 {
        return;
    }

    let min_x = v.iter().map(|p| p.x).fold(f32::INFINITY, f32::min).floor().max(0.0) as u32;
    let min_y = v.iter().map(|p| p.y).fold(f32::INFINITY, f32::min).floor().max(0.0) as u32;
    let max_x = v.iter().map(|p| p.x).fold(f32::NEG_INFINITY, f32::max).ceil().min(w as f32) as u32;
    let max_y = v.iter().map(|p| p.y).fold(f32::NEG_INFINITY, f32::max).ceil().min(h as f32) as u32;

    for y in min_y..max_y {
        for x in min_x..max_x {
            let (px, py) = (x as f32 + 0.5, y as f32 + 0.5);
            let b0 = edge(v[1], v[2], px, py) / area;
            let b1 = edge(v[2], v[0], px, py) / area;
            let b2 = edge(v[0], v[1], px, py) / area;
            if b0 >= 0.0 && b1 >= 0.0 && b2 >= 0.0 {
                f(x, y, [b0, b1, b2]);
            }
        }
    }
}

/// Decode tightly packed texels into `[f32; 4]`.
fn decode_texels(format: PixelFormat, data: &[u8]) -> Option<Vec<[f32; 4]>> {
    let float = |b: &[u8]| f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
    match format {
        PixelFormat::Rgba32Float => Some(
            data.chunks_exact(16)
                .map(|c| [float(&c[0..4]), float(&c[4..8]), float(&c[8..12]), float(&c[12..16])])
                .collect(),
        ),
        PixelFormat::R32Float => Some(data.chunks_exact(4).map(|c| [float(c), 0.0, 0.0, 0.0]).collect()),
        PixelFormat::Rgba8Unorm | PixelFormat::Rgba8UnormSrgb => Some(
            data.chunks_exact(4)
                .map(|c| [c[0], c[1], c[2], c[3]].map(|b| b as f32 / 255.0))
                .collect(),
        ),
        PixelFormat::Rgba16Float | PixelFormat::Depth32Float => None,
    }
}

impl RenderBackend for SoftwareBackend {
    fn name(&self) -> &str {
        "software"
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
        if self.unsupported_formats.contains(&format) {
            return Err(AllocationError::RenderTarget {
                label: "probe".to_string(),
                reason: format!("{:?} is not renderable", format),
            });
        }
        if width == 0 || height == 0 {
            return Err(AllocationError::RenderTarget {
                label: "probe".to_string(),
                reason: "zero-sized target".to_string(),
            });
        }
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, AllocationError> {
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 {
            return Err(AllocationError::Texture {
                label: desc.label.clone(),
                reason: format!("zero-sized texture {}x{}x{}", desc.width, desc.height, desc.depth),
            });
        }
        if let Some(budget) = self.texture_budget {
            if self.live_textures() >= budget {
                return Err(AllocationError::Texture {
                    label: desc.label.clone(),
                    reason: format!("texture budget of {} exhausted", budget),
                });
            }
        }
        let id = self.alloc_id();
        self.textures.insert(id, SoftTexture::new(desc.clone()));
        trace!(target: "software", id, label = %desc.label, "texture created");
        Ok(TextureId(id))
    }

    fn write_texture(&mut self, texture: TextureId, data: &[u8]) -> Result<(), AllocationError> {
        let tex = self
            .textures
            .get_mut(&texture.0)
            .ok_or_else(|| AllocationError::Upload {
                reason: format!("texture {} is not live", texture.0),
            })?;
        if data.len() != tex.desc.byte_size() {
            return Err(AllocationError::Upload {
                reason: format!(
                    "'{}' expects {} bytes, got {}",
                    tex.desc.label,
                    tex.desc.byte_size(),
                    data.len()
                ),
            });
        }
        let texels = decode_texels(tex.desc.format, data).ok_or_else(|| AllocationError::Upload {
            reason: format!("uploads of {:?} are not supported", tex.desc.format),
        })?;
        tex.texels.as_mut_slice().copy_from_slice(&texels);
        Ok(())
    }

    fn release_texture(&mut self, texture: TextureId) {
        if texture == BACKBUFFER {
            return;
        }
        if self.textures.remove(&texture.0).is_some() {
            trace!(target: "software", id = texture.0, "texture released");
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

        let mut size = None;
        for id in desc.colors.iter().chain(desc.depth.iter()) {
            let tex = self
                .textures
                .get(&id.0)
                .filter(|_| *id != BACKBUFFER)
                .ok_or_else(|| fail(format!("texture {} is not live", id.0)))?;
            if self.unsupported_formats.contains(&tex.desc.format) {
                return Err(fail(format!("{:?} is not renderable", tex.desc.format)));
            }
            match size {
                None => size = Some(tex.size()),
                Some(s) if s != tex.size() => return Err(fail("attachment sizes differ".to_string())),
                Some(_) => {}
            }
        }
        if let Some(depth) = desc.depth {
            if !self.textures[&depth.0].desc.format.is_depth() {
                return Err(fail("depth attachment has a color format".to_string()));
            }
        }

        let id = self.alloc_id();
        self.targets.insert(id, desc.clone());
        trace!(target: "software", id, label = %desc.label, "render target created");
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
        self.commands.push(Command::Bind(target));
        Ok(())
    }

    fn clear(&mut self, values: &ClearValues) -> Result<(), FrameError> {
        let (colors, depth) = self.attachments()?;
        if let Some(c) = values.color {
            for id in &colors {
                if let Some(tex) = self.textures.get_mut(&id.0) {
                    tex.texels.as_mut_slice().fill(c);
                }
            }
        }
        if let (Some(d), Some(id)) = (values.depth, depth) {
            if let Some(tex) = self.textures.get_mut(&id.0) {
                tex.texels.as_mut_slice().fill([d, 0.0, 0.0, 0.0]);
            }
        }
        if self.bound.is_none() {
            self.hud.clear();
        }
        self.commands.push(Command::Clear {
            target: self.bound,
            values: *values,
        });
        Ok(())
    }

    fn resize_backbuffer(&mut self, width: u32, height: u32) -> Result<(), AllocationError> {
        if width == 0 || height == 0 {
            return Err(AllocationError::Texture {
                label: "backbuffer".to_string(),
                reason: format!("zero-sized backbuffer {}x{}", width, height),
            });
        }
        self.textures.insert(
            BACKBUFFER.0,
            SoftTexture::new(TextureDesc::d2("backbuffer", width, height, PixelFormat::Rgba8Unorm)),
        );
        debug!(target: "software", width, height, "backbuffer resized");
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
        self.techniques.push(SoftTechnique {
            def,
            params: HashMap::new(),
        });
        Ok(TechniqueId(self.techniques.len() as u32 - 1))
    }

    fn set_param(
        &mut self,
        technique: TechniqueId,
        name: &str,
        value: ParamValue,
    ) -> Result<(), FrameError> {
        let tech = self
            .techniques
            .get_mut(technique.0 as usize)
            .ok_or_else(|| FrameError::Backend(format!("technique {} is not loaded", technique.0)))?;
        let def = tech.def;
        let key = def
            .uniforms
            .iter()
            .map(|(n, _)| *n)
            .chain(def.textures.iter().map(|t| t.name))
            .find(|n| *n == name)
            .ok_or_else(|| FrameError::Backend(format!("{} has no parameter '{}'", def.name, name)))?;
        tech.params.insert(key, value);
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall) -> Result<(), FrameError> {
        let tech = self
            .techniques
            .get(call.technique.0 as usize)
            .ok_or_else(|| FrameError::Backend(format!("technique {} is not loaded", call.technique.0)))?;
        let def = tech.def;
        if call.topology != def.topology {
            return Err(FrameError::Backend(format!(
                "{} draws {:?}, got {:?}",
                def.name, def.topology, call.topology
            )));
        }
        let values = tech.params.clone();
        let params = DrawParams { def, values: &values };

        let (colors, depth) = self.attachments()?;
        for slot in def.textures {
            let tex = params.texture(slot.name)?;
            if colors.contains(&tex) || depth == Some(tex) {
                return Err(FrameError::Hazard {
                    technique: def.name.to_string(),
                    texture: tex.0,
                });
            }
            self.texture(tex)?;
        }

        match def.name {
            effect::UPDATE => self.run_update(&params, &colors)?,
            effect::TERRAIN => self.run_terrain(&params, &colors, depth)?,
            effect::PARTICLES => self.run_particles(&params, &colors, depth, call.instance_count)?,
            effect::BLEND => self.run_blend(&params, &colors)?,
            other => return Err(FrameError::Backend(format!("no CPU implementation of {}", other))),
        }

        self.commands.push(Command::Draw {
            technique: def.name,
            target: self.bound,
            instances: call.instance_count,
        });
        Ok(())
    }

    fn draw_text(&mut self, x: f32, y: f32, color: [f32; 4], text: &str) {
        self.hud.push(HudText {
            x,
            y,
            color,
            text: text.to_string(),
        });
        self.commands.push(Command::Text(text.to_string()));
    }

    fn read_backbuffer(&mut self) -> Result<image::RgbaImage, FrameError> {
        let bb = self.texture(BACKBUFFER)?;
        let (w, h) = bb.size();
        let bytes = bb
            .texels
            .as_slice()
            .iter()
            .flat_map(|t| t.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8))
            .collect();
        image::RgbaImage::from_raw(w, h, bytes)
            .ok_or_else(|| FrameError::Backend("backbuffer size mismatch".to_string()))
    }
}
