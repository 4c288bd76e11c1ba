//! Camera state consumed by cascade fitting.

use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

/// Perspective camera described by its pose and frustum.
///
/// Projections use a right-handed view space with a `0..1` depth range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraState {
    pub position: Vec3,
    /// Unit view direction.
    pub direction: Vec3,
    pub up: Vec3,
    /// Vertical field of view in radians.
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 2.0, 8.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            fov_y: 45.0_f32.to_radians(),
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 100.0,
        }
    }
}

impl CameraState {
    pub fn new(
        position: Vec3,
        direction: Vec3,
        fov_y: f32,
        aspect: f32,
        near: f32,
        far: f32,
    ) -> Self {
        Self {
            position,
            direction: direction.normalize_or(Vec3::NEG_Z),
            up: Vec3::Y,
            fov_y,
            aspect,
            near,
            far,
        }
    }

    /// Camera at `position` looking toward `target`.
    pub fn looking_at(position: Vec3, target: Vec3, aspect: f32) -> Self {
        Self {
            position,
            direction: (target - position).normalize_or(Vec3::NEG_Z),
            aspect,
            ..Self::default()
        }
    }

    pub fn set_aspect_from_extent(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.aspect = width as f32 / height as f32;
        }
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.direction, self.up)
    }

    pub fn projection(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection() * self.view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn near_plane_maps_to_zero_depth() {
        let camera = CameraState::default();
        let point = camera.position + camera.direction * camera.near;
        let clip = camera.view_projection() * point.extend(1.0);
        assert_relative_eq!(clip.z / clip.w, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn looking_at_normalizes_direction() {
        let camera = CameraState::looking_at(Vec3::ZERO, Vec3::new(0.0, 0.0, -10.0), 1.0);
        assert_relative_eq!(camera.direction.length(), 1.0, epsilon = 1e-6);
    }
}
