//! Look-at camera shared by the terrain and particle passes.

use glam::{Mat4, Vec3};

/// Perspective camera looking from `eye` to `target`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    /// Camera position.
    pub eye: Vec3,
    /// Point the camera looks at.
    pub target: Vec3,
    /// Vertical field of view in radians.
    pub fov_y: f32,
    /// Near clip distance.
    pub near: f32,
    /// Far clip distance.
    pub far: f32,
}

impl Camera {
    /// Camera placed above the terrain, looking at the emitter.
    pub fn new() -> Self {
        Self {
            eye: Vec3::new(-1.2, 2.2, -1.2),
            target: Vec3::new(0.0, 0.5, 0.0),
            fov_y: std::f32::consts::FRAC_PI_4,
            near: 0.01,
            far: 100.0,
        }
    }

    /// Calculate the view matrix for rendering.
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.eye, self.target, Vec3::Y)
    }

    /// Projection matrix for a viewport aspect ratio.
    pub fn proj_matrix(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, aspect, self.near, self.far)
    }

    /// Combined projection and view, world space to clip space.
    pub fn view_proj(&self, aspect: f32) -> Mat4 {
        self.proj_matrix(aspect) * self.view_matrix()
    }

    /// World-space right and up axes, for camera-facing billboards.
    pub fn billboard_axes(&self) -> (Vec3, Vec3) {
        let inv_view = self.view_matrix().inverse();
        (
            inv_view.x_axis.truncate().normalize(),
            inv_view.y_axis.truncate().normalize(),
        )
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new()
    }
}
