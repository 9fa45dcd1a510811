//! Techniques of the particle effect.
//!
//! Four techniques make up a frame: `Update` advances the particle state,
//! `Terrain` draws the height-mapped ground, `Particles` splats camera-facing
//! sprites into the fog capture, and `Blend` composites scene and fog onto
//! the backbuffer.
//!
//! Each [`TechniqueDef`] declares its parameters the way the WGSL expects
//! them: scalar and vector uniforms occupy one `vec4<f32>` slot, matrices
//! four, all packed in declaration order into the uniform buffer at
//! binding 0. Textures follow at bindings 1.. in declaration order and are
//! read with `textureLoad`, so no samplers are involved.

use crate::backend::{PixelFormat, TextureDimension, Topology};

/// Technique names.
pub const UPDATE: &str = "Update";
pub const TERRAIN: &str = "Terrain";
pub const PARTICLES: &str = "Particles";
pub const BLEND: &str = "Blend";

/// Parameter names shared by the host and the techniques.
pub mod param {
    pub const ACCUMULATE_TIME: &str = "accumulate_time";
    pub const ELAPSE_TIME: &str = "elapse_time";
    pub const INIT_POS_LIFE: &str = "init_pos_life";
    pub const MODEL: &str = "model";
    /// `(gravity, restitution, 0, 0)`
    pub const PHYSICS: &str = "physics";
    /// `(extent, height_scale, grid_resolution, 0)`
    pub const TERRAIN: &str = "terrain";
    pub const LIGHT_DIR: &str = "light_dir";
    pub const VIEW_PROJ: &str = "view_proj";
    pub const CAMERA_RIGHT: &str = "camera_right";
    pub const CAMERA_UP: &str = "camera_up";
    pub const POINT_RADIUS: &str = "point_radius";
    /// `(width, height, 0, 0)` of the slot grid.
    pub const GRID: &str = "grid";

    pub const PARTICLE_POS_TEX: &str = "particle_pos_tex";
    pub const PARTICLE_VEL_TEX: &str = "particle_vel_tex";
    pub const PARTICLE_BIRTH_TIME_TEX: &str = "particle_birth_time_tex";
    pub const PARTICLE_INIT_VEL_TEX: &str = "particle_init_vel_tex";
    pub const HEIGHT_MAP_TEX: &str = "height_map_tex";
    pub const NORMAL_MAP_TEX: &str = "normal_map_tex";
    pub const NOISE_VOLUME_TEX: &str = "noise_volume_tex";
    pub const SCENE_TEX: &str = "scene_tex";
    pub const FOG_TEX: &str = "fog_tex";
}

/// Shape of a uniform parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniformKind {
    /// Read from `.x` of a `vec4<f32>` slot.
    Float,
    /// A `vec4<f32>` slot; 2-vectors use `.xy`.
    Vec4,
    /// `mat4x4<f32>`, column major.
    Mat4,
}

impl UniformKind {
    /// Number of `vec4<f32>` slots occupied.
    pub fn slots(self) -> usize {
        match self {
            UniformKind::Float | UniformKind::Vec4 => 1,
            UniformKind::Mat4 => 4,
        }
    }
}

/// A texture parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureSlot {
    pub name: &'static str,
    pub dimension: TextureDimension,
}

/// Format of a color output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFormat {
    Fixed(PixelFormat),
    /// Whatever format the backend's backbuffer uses.
    Backbuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthMode {
    None,
    /// Depth test and write.
    ReadWrite,
    /// Depth test only.
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    Replace,
    /// `src * src.a + dst * (1 - src.a)` for color, `src.a + dst.a * (1 - src.a)` for alpha.
    Alpha,
}

/// Static description of a technique.
#[derive(Debug)]
pub struct TechniqueDef {
    pub name: &'static str,
    pub uniforms: &'static [(&'static str, UniformKind)],
    pub textures: &'static [TextureSlot],
    pub targets: &'static [TargetFormat],
    pub depth: DepthMode,
    pub blend: BlendMode,
    pub topology: Topology,
    source: &'static [&'static str],
}

impl TechniqueDef {
    /// Complete WGSL module.
    pub fn wgsl(&self) -> String {
        self.source.concat()
    }

    /// Kind and first `vec4` slot of a uniform parameter.
    pub fn uniform(&self, name: &str) -> Option<(UniformKind, usize)> {
        let mut slot = 0;
        for &(n, kind) in self.uniforms {
            if n == name {
                return Some((kind, slot));
            }
            slot += kind.slots();
        }
        None
    }

    /// Total `vec4` slots of the uniform block.
    pub fn uniform_slots(&self) -> usize {
        self.uniforms.iter().map(|(_, k)| k.slots()).sum()
    }

    /// Binding index of a texture parameter.
    pub fn texture_binding(&self, name: &str) -> Option<u32> {
        self.textures
            .iter()
            .position(|t| t.name == name)
            .map(|i| i as u32 + 1)
    }
}

/// Every technique the effect provides.
pub static TECHNIQUES: [TechniqueDef; 4] = [
    TechniqueDef {
        name: UPDATE,
        uniforms: &[
            (param::ACCUMULATE_TIME, UniformKind::Float),
            (param::ELAPSE_TIME, UniformKind::Float),
            (param::INIT_POS_LIFE, UniformKind::Vec4),
            (param::MODEL, UniformKind::Mat4),
            (param::PHYSICS, UniformKind::Vec4),
            (param::TERRAIN, UniformKind::Vec4),
        ],
        textures: &[
            TextureSlot { name: param::PARTICLE_POS_TEX, dimension: TextureDimension::D2 },
            TextureSlot { name: param::PARTICLE_VEL_TEX, dimension: TextureDimension::D2 },
            TextureSlot { name: param::PARTICLE_BIRTH_TIME_TEX, dimension: TextureDimension::D2 },
            TextureSlot { name: param::PARTICLE_INIT_VEL_TEX, dimension: TextureDimension::D2 },
            TextureSlot { name: param::HEIGHT_MAP_TEX, dimension: TextureDimension::D2 },
            TextureSlot { name: param::NORMAL_MAP_TEX, dimension: TextureDimension::D2 },
        ],
        targets: &[
            TargetFormat::Fixed(PixelFormat::Rgba32Float),
            TargetFormat::Fixed(PixelFormat::Rgba32Float),
        ],
        depth: DepthMode::None,
        blend: BlendMode::Replace,
        topology: Topology::TriangleList,
        source: &[UPDATE_WGSL, FULLSCREEN_WGSL, GROUND_WGSL],
    },
    TechniqueDef {
        name: TERRAIN,
        uniforms: &[
            (param::VIEW_PROJ, UniformKind::Mat4),
            (param::TERRAIN, UniformKind::Vec4),
            (param::LIGHT_DIR, UniformKind::Vec4),
        ],
        textures: &[
            TextureSlot { name: param::HEIGHT_MAP_TEX, dimension: TextureDimension::D2 },
            TextureSlot { name: param::NORMAL_MAP_TEX, dimension: TextureDimension::D2 },
        ],
        targets: &[TargetFormat::Fixed(PixelFormat::Rgba16Float)],
        depth: DepthMode::ReadWrite,
        blend: BlendMode::Replace,
        topology: Topology::TriangleList,
        source: &[TERRAIN_WGSL, GROUND_WGSL],
    },
    TechniqueDef {
        name: PARTICLES,
        uniforms: &[
            (param::VIEW_PROJ, UniformKind::Mat4),
            (param::CAMERA_RIGHT, UniformKind::Vec4),
            (param::CAMERA_UP, UniformKind::Vec4),
            (param::POINT_RADIUS, UniformKind::Float),
            (param::GRID, UniformKind::Vec4),
        ],
        textures: &[
            TextureSlot { name: param::PARTICLE_POS_TEX, dimension: TextureDimension::D2 },
            TextureSlot { name: param::SCENE_TEX, dimension: TextureDimension::D2 },
            TextureSlot { name: param::NOISE_VOLUME_TEX, dimension: TextureDimension::D3 },
        ],
        targets: &[TargetFormat::Fixed(PixelFormat::Rgba16Float)],
        depth: DepthMode::ReadOnly,
        blend: BlendMode::Alpha,
        topology: Topology::TriangleStrip,
        source: &[PARTICLES_WGSL],
    },
    TechniqueDef {
        name: BLEND,
        uniforms: &[],
        textures: &[
            TextureSlot { name: param::SCENE_TEX, dimension: TextureDimension::D2 },
            TextureSlot { name: param::FOG_TEX, dimension: TextureDimension::D2 },
        ],
        targets: &[TargetFormat::Backbuffer],
        depth: DepthMode::None,
        blend: BlendMode::Replace,
        topology: Topology::TriangleList,
        source: &[BLEND_WGSL, FULLSCREEN_WGSL],
    },
];

/// Look up a technique by name.
pub fn technique(name: &str) -> Option<&'static TechniqueDef> {
    TECHNIQUES.iter().find(|t| t.name == name)
}

/// Fullscreen triangle vertex stage.
pub const FULLSCREEN_WGSL: &str = r#"
struct FullscreenOut {
    @builtin(position) clip_position: vec4<f32>,
};

@vertex
fn vs_main(@builtin(vertex_index) vertex_index: u32) -> FullscreenOut {
    var positions = array<vec2<f32>, 3>(
        vec2<f32>(-1.0, -1.0),
        vec2<f32>(3.0, -1.0),
        vec2<f32>(-1.0, 3.0),
    );
    var out: FullscreenOut;
    out.clip_position = vec4<f32>(positions[vertex_index], 0.0, 1.0);
    return out;
}
"#;

/// Nearest-texel terrain lookups. Expects `params.terrain`,
/// `height_map_tex` and `normal_map_tex` in the including module.
pub const GROUND_WGSL: &str = r#"
fn terrain_coord(world_xz: vec2<f32>, size: vec2<u32>) -> vec2<i32> {
    let dims = vec2<f32>(size);
    let uv = world_xz / params.terrain.x + vec2<f32>(0.5, 0.5);
    let texel = clamp(floor(uv * dims), vec2<f32>(0.0, 0.0), dims - vec2<f32>(1.0, 1.0));
    return vec2<i32>(texel);
}

fn ground_height(world_xz: vec2<f32>) -> f32 {
    let coord = terrain_coord(world_xz, textureDimensions(height_map_tex));
    return textureLoad(height_map_tex, coord, 0).r * params.terrain.y;
}

fn ground_normal(world_xz: vec2<f32>) -> vec3<f32> {
    let coord = terrain_coord(world_xz, textureDimensions(normal_map_tex));
    return textureLoad(normal_map_tex, coord, 0).xyz;
}
"#;

pub const UPDATE_WGSL: &str = r#"
struct Params {
    accumulate_time: vec4<f32>,
    elapse_time: vec4<f32>,
    init_pos_life: vec4<f32>,
    model: mat4x4<f32>,
    physics: vec4<f32>,
    terrain: vec4<f32>,
};

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var particle_pos_tex: texture_2d<f32>;
@group(0) @binding(2) var particle_vel_tex: texture_2d<f32>;
@group(0) @binding(3) var particle_birth_time_tex: texture_2d<f32>;
@group(0) @binding(4) var particle_init_vel_tex: texture_2d<f32>;
@group(0) @binding(5) var height_map_tex: texture_2d<f32>;
@group(0) @binding(6) var normal_map_tex: texture_2d<f32>;

struct UpdateOut {
    @location(0) position: vec4<f32>,
    @location(1) velocity: vec4<f32>,
};

@fragment
fn fs_main(in: FullscreenOut) -> UpdateOut {
    let coord = vec2<i32>(floor(in.clip_position.xy));
    let old_pos = textureLoad(particle_pos_tex, coord, 0);
    let old_vel = textureLoad(particle_vel_tex, coord, 0);
    let birth_time = textureLoad(particle_birth_time_tex, coord, 0).r;
    let init_vel = textureLoad(particle_init_vel_tex, coord, 0);
    let dt = params.elapse_time.x;

    var out: UpdateOut;
    if (params.accumulate_time.x < birth_time) {
        out.position = vec4<f32>(0.0, 0.0, 0.0, -1.0);
        out.velocity = vec4<f32>(0.0);
        return out;
    }

    if (old_pos.w < 0.0) {
        let spawn = params.model * vec4<f32>(params.init_pos_life.xyz, 1.0);
        out.position = vec4<f32>(spawn.xyz, params.init_pos_life.w);
        out.velocity = vec4<f32>(init_vel.xyz, 0.0);
        return out;
    }

    if (old_pos.w == 0.0) {
        out.position = old_pos;
        out.velocity = vec4<f32>(0.0);
        return out;
    }

    var vel = old_vel.xyz;
    vel.y = vel.y - params.physics.x * dt;
    var pos = old_pos.xyz + vel * dt;
    var life = old_pos.w - dt;
    if (life <= 0.0) {
        life = 0.0;
    }

    let floor_height = ground_height(pos.xz);
    if (pos.y < floor_height) {
        pos.y = floor_height;
        let n = ground_normal(pos.xz);
        vel = reflect(vel, n) * params.physics.y;
    }

    out.position = vec4<f32>(pos, life);
    out.velocity = vec4<f32>(vel, 0.0);
    return out;
}
"#;

pub const TERRAIN_WGSL: &str = r#"
struct Params {
    view_proj: mat4x4<f32>,
    terrain: vec4<f32>,
    light_dir: vec4<f32>,
};

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var height_map_tex: texture_2d<f32>;
@group(0) @binding(2) var normal_map_tex: texture_2d<f32>;

struct TerrainOut {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_xz: vec2<f32>,
    @location(1) height: f32,
};

@vertex
fn vs_main(@builtin(vertex_index) vertex_index: u32) -> TerrainOut {
    let res = max(u32(params.terrain.z), 1u);
    let quad = vertex_index / 6u;
    let corner = vertex_index % 6u;
    var offsets = array<vec2<u32>, 6>(
        vec2<u32>(0u, 0u),
        vec2<u32>(1u, 0u),
        vec2<u32>(0u, 1u),
        vec2<u32>(0u, 1u),
        vec2<u32>(1u, 0u),
        vec2<u32>(1u, 1u),
    );
    let cell = vec2<u32>(quad % res, quad / res) + offsets[corner];
    let uv = vec2<f32>(cell) / f32(res);
    let xz = (uv - vec2<f32>(0.5, 0.5)) * params.terrain.x;
    let h = ground_height(xz);

    var out: TerrainOut;
    out.clip_position = params.view_proj * vec4<f32>(xz.x, h, xz.y, 1.0);
    out.world_xz = xz;
    out.height = h;
    return out;
}

@fragment
fn fs_main(in: TerrainOut) -> @location(0) vec4<f32> {
    let n = ground_normal(in.world_xz);
    let diffuse = max(dot(n, normalize(params.light_dir.xyz)), 0.0);
    let grass = vec3<f32>(0.32, 0.5, 0.18);
    let rock = vec3<f32>(0.6, 0.55, 0.45);
    let t = clamp(in.height / max(params.terrain.y, 0.0001), 0.0, 1.0);
    return vec4<f32>(mix(grass, rock, t) * (0.25 + 0.75 * diffuse), 1.0);
}
"#;

pub const PARTICLES_WGSL: &str = r#"
struct Params {
    view_proj: mat4x4<f32>,
    camera_right: vec4<f32>,
    camera_up: vec4<f32>,
    point_radius: vec4<f32>,
    grid: vec4<f32>,
};

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var particle_pos_tex: texture_2d<f32>;
@group(0) @binding(2) var scene_tex: texture_2d<f32>;
@group(0) @binding(3) var noise_volume_tex: texture_3d<f32>;

struct ParticleOut {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) corner: vec2<f32>,
    @location(1) noise_coord: vec3<f32>,
};

@vertex
fn vs_main(
    @builtin(vertex_index) vertex_index: u32,
    @builtin(instance_index) instance_index: u32,
) -> ParticleOut {
    let width = max(u32(params.grid.x), 1u);
    let coord = vec2<i32>(i32(instance_index % width), i32(instance_index / width));
    let pos_life = textureLoad(particle_pos_tex, coord, 0);

    var corners = array<vec2<f32>, 4>(
        vec2<f32>(-1.0, -1.0),
        vec2<f32>(1.0, -1.0),
        vec2<f32>(-1.0, 1.0),
        vec2<f32>(1.0, 1.0),
    );
    let corner = corners[vertex_index];

    var out: ParticleOut;
    out.corner = corner;
    out.noise_coord = pos_life.xyz * 0.5;
    if (pos_life.w <= 0.0) {
        // Outside the clip volume: the sprite is discarded before rasterization.
        out.clip_position = vec4<f32>(2.0, 2.0, 2.0, 1.0);
        return out;
    }

    let offset = params.camera_right.xyz * corner.x + params.camera_up.xyz * corner.y;
    let world = pos_life.xyz + offset * params.point_radius.x;
    out.clip_position = params.view_proj * vec4<f32>(world, 1.0);
    return out;
}

@fragment
fn fs_main(in: ParticleOut) -> @location(0) vec4<f32> {
    let r2 = dot(in.corner, in.corner);
    if (r2 > 1.0) {
        discard;
    }

    let pixel = vec2<i32>(floor(in.clip_position.xy));
    let scene = textureLoad(scene_tex, pixel, 0).rgb;

    let dims = vec3<f32>(textureDimensions(noise_volume_tex));
    let n = fract(in.noise_coord);
    let texel = clamp(floor(n * dims), vec3<f32>(0.0), dims - vec3<f32>(1.0));
    let density = textureLoad(noise_volume_tex, vec3<i32>(texel), 0).a;

    let alpha = (1.0 - r2) * (0.35 + 0.65 * density) * 0.6;
    let tint = vec3<f32>(0.85, 0.9, 1.0);
    return vec4<f32>(mix(tint, scene, 0.35), alpha);
}
"#;

pub const BLEND_WGSL: &str = r#"
@group(0) @binding(1) var scene_tex: texture_2d<f32>;
@group(0) @binding(2) var fog_tex: texture_2d<f32>;

@fragment
fn fs_main(in: FullscreenOut) -> @location(0) vec4<f32> {
    let pixel = vec2<i32>(floor(in.clip_position.xy));
    let scene = textureLoad(scene_tex, pixel, 0);
    let fog = textureLoad(fog_tex, pixel, 0);
    let a = clamp(fog.a, 0.0, 1.0);
    return vec4<f32>(scene.rgb * (1.0 - a) + fog.rgb, 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name() {
        for name in [UPDATE, TERRAIN, PARTICLES, BLEND] {
            assert_eq!(technique(name).map(|t| t.name), Some(name));
        }
        assert!(technique("Missing").is_none());
    }

    #[test]
    fn test_uniform_slots_follow_declaration_order() {
        let update = technique(UPDATE).unwrap();
        assert_eq!(update.uniform(param::ACCUMULATE_TIME), Some((UniformKind::Float, 0)));
        assert_eq!(update.uniform(param::MODEL), Some((UniformKind::Mat4, 3)));
        assert_eq!(update.uniform(param::PHYSICS), Some((UniformKind::Vec4, 7)));
        assert_eq!(update.uniform_slots(), 9);
        assert_eq!(update.texture_binding(param::PARTICLE_POS_TEX), Some(1));
        assert_eq!(update.texture_binding(param::NORMAL_MAP_TEX), Some(6));
    }

    #[test]
    fn test_update_writes_two_float_targets() {
        let update = technique(UPDATE).unwrap();
        assert_eq!(update.targets.len(), 2);
        assert!(update
            .targets
            .iter()
            .all(|t| *t == TargetFormat::Fixed(PixelFormat::Rgba32Float)));
    }

    #[test]
    fn test_sources_declare_every_binding() {
        for def in TECHNIQUES.iter() {
            let src = def.wgsl();
            for tex in def.textures {
                assert!(src.contains(&format!("var {}:", tex.name)), "{} missing {}", def.name, tex.name);
            }
            for (name, _) in def.uniforms {
                assert!(src.contains(&format!("{}:", name)), "{} missing {}", def.name, name);
            }
        }
    }
}
