//! Slot grid and texel arrays.
//!
//! Particles have no object identity: a particle *is* a texel position in a
//! fixed `width x height` grid. Every per-particle attribute lives in a
//! parallel [`TexelGrid`] indexed by the same coordinate.

use crate::error::ConfigurationError;

/// Default number of slots per grid row.
pub const DEFAULT_GRID_WIDTH: u32 = 256;

/// Fixed mapping between slot indices and texel coordinates.
///
/// Indices are row-major: `index = y * width + x`. The last row may contain
/// padding slots past `max_particles`; they exist in every texture but are
/// never emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotGrid {
    width: u32,
    height: u32,
    max_particles: u32,
}

impl SlotGrid {
    /// Size a grid for `max_particles` slots, `width` slots per row.
    pub fn new(max_particles: u32, width: u32) -> Result<Self, ConfigurationError> {
        if max_particles == 0 {
            return Err(ConfigurationError::NoParticles);
        }
        if width == 0 {
            return Err(ConfigurationError::InvalidGridWidth(width));
        }
        let height = max_particles.div_ceil(width);
        if width.checked_mul(height).is_none() {
            return Err(ConfigurationError::GridTooLarge {
                max_particles,
                width,
            });
        }
        Ok(Self {
            width,
            height,
            max_particles,
        })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of slots that take part in emission.
    #[inline]
    pub fn max_particles(&self) -> u32 {
        self.max_particles
    }

    /// Total texel count, padding included.
    #[inline]
    pub fn slot_count(&self) -> u32 {
        self.width * self.height
    }

    /// Texel coordinate of a slot index.
    #[inline]
    pub fn coord(&self, index: u32) -> (u32, u32) {
        (index % self.width, index / self.width)
    }

    /// Slot index of a texel coordinate.
    #[inline]
    pub fn index(&self, x: u32, y: u32) -> u32 {
        y * self.width + x
    }

    /// Whether the slot takes part in emission.
    #[inline]
    pub fn is_emitting(&self, index: u32) -> bool {
        index < self.max_particles
    }

    /// Normalized texel-center coordinate of a slot, as used for instance lookup.
    pub fn uv(&self, index: u32) -> [f32; 2] {
        let (x, y) = self.coord(index);
        [
            (x as f32 + 0.5) / self.width as f32,
            (y as f32 + 0.5) / self.height as f32,
        ]
    }
}

/// A 2D array of plain values laid out row-major like a texture.
#[derive(Debug, Clone, PartialEq)]
pub struct TexelGrid<T> {
    width: u32,
    height: u32,
    data: Vec<T>,
}

impl<T: Copy> TexelGrid<T> {
    /// Grid filled with one value.
    pub fn filled(width: u32, height: u32, value: T) -> Self {
        Self {
            width,
            height,
            data: vec![value; (width * height) as usize],
        }
    }

    /// Grid built from a per-coordinate function.
    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> T) -> Self {
        let mut data = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self { width, height, data }
    }

    /// Wrap existing row-major data. Returns `None` on a size mismatch.
    pub fn from_vec(width: u32, height: u32, data: Vec<T>) -> Option<Self> {
        if data.len() != (width * height) as usize {
            return None;
        }
        Some(Self { width, height, data })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> T {
        self.data[(y * self.width + x) as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: T) {
        self.data[(y * self.width + x) as usize] = value;
    }

    /// Value at a clamped integer coordinate.
    #[inline]
    pub fn get_clamped(&self, x: i64, y: i64) -> T {
        let x = x.clamp(0, self.width as i64 - 1) as u32;
        let y = y.clamp(0, self.height as i64 - 1) as u32;
        self.get(x, y)
    }

    /// Nearest-texel lookup for a normalized coordinate, clamped to the edge.
    pub fn sample_nearest(&self, u: f32, v: f32) -> T {
        let x = (u * self.width as f32).floor() as i64;
        let y = (v * self.height as f32).floor() as i64;
        self.get_clamped(x, y)
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T: bytemuck::Pod> TexelGrid<T> {
    /// Raw bytes, ready for a texture upload.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_sizing_rounds_up() {
        let grid = SlotGrid::new(65536, 256).unwrap();
        assert_eq!((grid.width(), grid.height()), (256, 256));

        let grid = SlotGrid::new(1000, 256).unwrap();
        assert_eq!(grid.height(), 4);
        assert_eq!(grid.slot_count(), 1024);
        assert!(grid.is_emitting(999));
        assert!(!grid.is_emitting(1000));
    }

    #[test]
    fn test_grid_rejects_empty() {
        assert_eq!(SlotGrid::new(0, 256), Err(ConfigurationError::NoParticles));
        assert_eq!(
            SlotGrid::new(10, 0),
            Err(ConfigurationError::InvalidGridWidth(0))
        );
    }

    #[test]
    fn test_grid_rejects_slot_count_overflow() {
        // 65536 rows of 65536 slots is one more than u32::MAX.
        assert_eq!(
            SlotGrid::new(u32::MAX, 65536),
            Err(ConfigurationError::GridTooLarge {
                max_particles: u32::MAX,
                width: 65536,
            })
        );
        let grid = SlotGrid::new(u32::MAX, 1).unwrap();
        assert_eq!(grid.slot_count(), u32::MAX);
    }

    #[test]
    fn test_index_coord_bijection() {
        let grid = SlotGrid::new(1000, 7).unwrap();
        let mut seen = std::collections::HashSet::new();
        for i in 0..grid.slot_count() {
            let (x, y) = grid.coord(i);
            assert!(x < grid.width() && y < grid.height());
            assert_eq!(grid.index(x, y), i);
            assert!(seen.insert((x, y)));
        }
    }

    #[test]
    fn test_uv_is_texel_center() {
        let grid = SlotGrid::new(512, 256).unwrap();
        assert_eq!(grid.uv(0), [0.5 / 256.0, 0.25]);
        assert_eq!(grid.uv(257), [1.5 / 256.0, 0.75]);
    }

    #[test]
    fn test_texel_grid_sampling() {
        let g = TexelGrid::from_fn(4, 2, |x, y| (y * 4 + x) as f32);
        assert_eq!(g.get(3, 1), 7.0);
        assert_eq!(g.sample_nearest(0.0, 0.0), 0.0);
        assert_eq!(g.sample_nearest(0.99, 0.99), 7.0);
        assert_eq!(g.sample_nearest(-3.0, 5.0), 4.0);
        assert!(TexelGrid::from_vec(2, 2, vec![0.0f32; 3]).is_none());
    }
}
