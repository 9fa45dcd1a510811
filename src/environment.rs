//! Environmental inputs: terrain height/normal maps and the noise volume.
//!
//! The simulation only ever reads these. They are supplied once by the host,
//! either loaded from image files or generated procedurally.

use std::path::Path;

use glam::Vec3;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::grid::TexelGrid;

/// Placement of the terrain in world space.
///
/// The terrain is a square of side `extent` centered on the origin in the
/// XZ plane; a height-map value of 1.0 is `height_scale` world units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainParams {
    pub extent: f32,
    pub height_scale: f32,
}

impl Default for TerrainParams {
    fn default() -> Self {
        Self {
            extent: 4.0,
            height_scale: 0.5,
        }
    }
}

impl TerrainParams {
    /// Height-map coordinate of a world-space XZ position.
    #[inline]
    pub fn uv(&self, x: f32, z: f32) -> (f32, f32) {
        (x / self.extent + 0.5, z / self.extent + 0.5)
    }
}

/// Height and normal maps shared by the terrain pass and the simulation.
#[derive(Debug, Clone)]
pub struct EnvironmentMaps {
    /// Normalized heights in `[0, 1]`.
    pub height: TexelGrid<f32>,
    /// Unit normals in world space (y up), `w` unused.
    pub normal: TexelGrid<[f32; 4]>,
    pub terrain: TerrainParams,
}

impl EnvironmentMaps {
    /// Build maps from a height field, deriving normals from its gradient.
    pub fn from_height(height: TexelGrid<f32>, terrain: TerrainParams) -> Self {
        let normal = derive_normals(&height, &terrain);
        Self {
            height,
            normal,
            terrain,
        }
    }

    /// Rolling hills, useful when no terrain assets are available.
    pub fn procedural(size: u32, terrain: TerrainParams) -> Self {
        let height = TexelGrid::from_fn(size, size, |x, y| {
            let u = x as f32 / size as f32 * std::f32::consts::TAU;
            let v = y as f32 / size as f32 * std::f32::consts::TAU;
            0.35 + 0.2 * (u * 2.0).sin() * (v * 1.5).cos() + 0.1 * (u * 5.0 + v * 3.0).sin()
        });
        Self::from_height(height, terrain)
    }

    /// Completely flat terrain at height zero.
    pub fn flat(size: u32, terrain: TerrainParams) -> Self {
        Self::from_height(TexelGrid::filled(size, size, 0.0), terrain)
    }

    /// Load a height map and, optionally, a normal map from image files.
    ///
    /// Heights come from the luminance channel. Normal maps are decoded from
    /// RGB as `rgb * 2 - 1`; without one, normals are derived from heights.
    /// A normal map must have the same dimensions as the height map.
    pub fn from_files<P: AsRef<Path>>(
        height_path: P,
        normal_path: Option<P>,
        terrain: TerrainParams,
    ) -> Result<Self, ConfigError> {
        let img = image::open(height_path.as_ref())?.into_luma8();
        let (w, h) = img.dimensions();
        let heights = img.into_raw().into_iter().map(|v| v as f32 / 255.0).collect();
        let height = TexelGrid::from_vec(w, h, heights).ok_or_else(|| ConfigError::Asset {
            path: height_path.as_ref().display().to_string(),
            reason: format!("height map does not hold {}x{} pixels", w, h),
        })?;

        let normal = match normal_path {
            Some(path) => {
                let img = image::open(path.as_ref())?.into_rgb8();
                let (nw, nh) = img.dimensions();
                if (nw, nh) != (w, h) {
                    return Err(ConfigError::Asset {
                        path: path.as_ref().display().to_string(),
                        reason: format!("normal map is {}x{} but the height map is {}x{}", nw, nh, w, h),
                    });
                }
                let texels = img
                    .pixels()
                    .map(|p| {
                        let n = Vec3::new(
                            p[0] as f32 / 127.5 - 1.0,
                            p[1] as f32 / 127.5 - 1.0,
                            p[2] as f32 / 127.5 - 1.0,
                        )
                        .normalize_or(Vec3::Y);
                        [n.x, n.y, n.z, 0.0]
                    })
                    .collect();
                TexelGrid::from_vec(nw, nh, texels).ok_or_else(|| ConfigError::Asset {
                    path: path.as_ref().display().to_string(),
                    reason: format!("normal map does not hold {}x{} pixels", nw, nh),
                })?
            }
            None => derive_normals(&height, &terrain),
        };

        Ok(Self {
            height,
            normal,
            terrain,
        })
    }
}

/// Terrain lookups the simulation needs.
///
/// Implemented by [`EnvironmentMaps`] and by backends that keep the maps in
/// their own texture storage.
pub trait Ground {
    /// Terrain height in world units below a world-space XZ position.
    fn height_at(&self, x: f32, z: f32) -> f32;

    /// Terrain normal below a world-space XZ position.
    fn normal_at(&self, x: f32, z: f32) -> Vec3;
}

impl Ground for EnvironmentMaps {
    fn height_at(&self, x: f32, z: f32) -> f32 {
        let (u, v) = self.terrain.uv(x, z);
        self.height.sample_nearest(u, v) * self.terrain.height_scale
    }

    fn normal_at(&self, x: f32, z: f32) -> Vec3 {
        let (u, v) = self.terrain.uv(x, z);
        let n = self.normal.sample_nearest(u, v);
        Vec3::new(n[0], n[1], n[2])
    }
}

/// Central-difference normals of a height field.
fn derive_normals(height: &TexelGrid<f32>, terrain: &TerrainParams) -> TexelGrid<[f32; 4]> {
    let texel_x = terrain.extent / height.width() as f32;
    let texel_z = terrain.extent / height.height() as f32;
    TexelGrid::from_fn(height.width(), height.height(), |x, y| {
        let (x, y) = (x as i64, y as i64);
        let dx = (height.get_clamped(x + 1, y) - height.get_clamped(x - 1, y)) * terrain.height_scale;
        let dz = (height.get_clamped(x, y + 1) - height.get_clamped(x, y - 1)) * terrain.height_scale;
        let n = Vec3::new(-dx / (2.0 * texel_x), 1.0, -dz / (2.0 * texel_z)).normalize();
        [n.x, n.y, n.z, 0.0]
    })
}

/// Periodic 3D noise: random density with gradient normals.
///
/// Texels are RGBA8: `rgb` is the density-gradient normal remapped to
/// `[0, 255]`, `a` the density.
#[derive(Debug, Clone)]
pub struct NoiseVolume {
    size: u32,
    texels: Vec<[u8; 4]>,
}

impl NoiseVolume {
    /// Generate a `size^3` volume from a seed.
    pub fn generate(size: u32, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let count = (size as usize).pow(3);
        let mut texels = vec![[0u8; 4]; count];
        for t in texels.iter_mut() {
            t[3] = rng.gen_range(0..=255u8);
        }

        let density = |texels: &[[u8; 4]], x: i64, y: i64, z: i64| -> f32 {
            let s = size as i64;
            let (x, y, z) = (x.rem_euclid(s), y.rem_euclid(s), z.rem_euclid(s));
            texels[((z * s + y) * s + x) as usize][3] as f32 / 255.0 - 0.5
        };

        const HEIGHT_ADJUST: f32 = 0.5;
        let mut normals = Vec::with_capacity(count);
        for z in 0..size as i64 {
            for y in 0..size as i64 {
                for x in 0..size as i64 {
                    let n = Vec3::new(
                        density(&texels, x + 1, y, z) - density(&texels, x - 1, y, z),
                        density(&texels, x, y + 1, z) - density(&texels, x, y - 1, z),
                        density(&texels, x, y, z + 1) - density(&texels, x, y, z - 1),
                    ) / HEIGHT_ADJUST;
                    normals.push(n.normalize_or(Vec3::Y));
                }
            }
        }

        for (t, n) in texels.iter_mut().zip(normals) {
            let encode = |c: f32| ((c / 2.0 + 0.5) * 255.0).clamp(0.0, 255.0) as u8;
            t[0] = encode(n.x);
            t[1] = encode(n.y);
            t[2] = encode(n.z);
        }

        Self { size, texels }
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Texel at a wrapped integer coordinate.
    pub fn texel(&self, x: i64, y: i64, z: i64) -> [u8; 4] {
        let s = self.size as i64;
        let (x, y, z) = (x.rem_euclid(s), y.rem_euclid(s), z.rem_euclid(s));
        self.texels[((z * s + y) * s + x) as usize]
    }

    /// Density in `[0, 1]` at a wrapped normalized coordinate.
    pub fn density(&self, p: Vec3) -> f32 {
        let s = self.size as f32;
        self.texel((p.x * s).floor() as i64, (p.y * s).floor() as i64, (p.z * s).floor() as i64)[3] as f32
            / 255.0
    }

    /// Raw bytes, ready for a 3D texture upload.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.texels)
    }
}
