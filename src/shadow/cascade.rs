//! Cascade split calculation and per-cascade frustum fitting for directional lights.
//!
//! The camera frustum is divided into up to [`MAX_CASCADES`] slices using a blend
//! of logarithmic and uniform splits. Each slice is enclosed by a light-aligned
//! orthographic box whose origin is snapped to whole shadow-map texels so that the
//! shadow does not shimmer as the camera moves.

use glam::{Mat4, Vec3, Vec4};

use crate::camera::CameraState;
use crate::config::{
    CascadeBounds, ShadowSettings, MAX_CASCADES, MIN_CASCADE_DEPTH_RANGE, MIN_CASCADE_NEAR,
};

/// Light-space cascade data for one directional light.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeSet {
    /// Far distance of each cascade; unused entries hold the camera far plane.
    pub splits: Vec4,
    /// View-projection of each cascade; unused entries are identity.
    pub view_proj: [Mat4; MAX_CASCADES],
}

impl Default for CascadeSet {
    fn default() -> Self {
        Self {
            splits: Vec4::ZERO,
            view_proj: [Mat4::IDENTITY; MAX_CASCADES],
        }
    }
}

/// Stateless cascade fitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeCalculator {
    lambda: f32,
    resolution: u32,
    bounds: CascadeBounds,
}

impl CascadeCalculator {
    pub fn new(lambda: f32, resolution: u32) -> Self {
        Self {
            lambda: lambda.clamp(0.0, 1.0),
            resolution: resolution.max(1),
            bounds: CascadeBounds::AxisDeviation,
        }
    }

    pub fn from_settings(settings: &ShadowSettings) -> Self {
        Self::new(settings.split_lambda, settings.directional_resolution)
            .with_bounds(settings.cascade_bounds)
    }

    pub fn with_bounds(mut self, bounds: CascadeBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn lambda(&self) -> f32 {
        self.lambda
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn bounds(&self) -> CascadeBounds {
        self.bounds
    }

    /// Practical split scheme: `λ·log + (1 − λ)·uniform`, last active split pinned to `far`.
    ///
    /// The logarithmic term is skipped for `λ == 0` and evaluated with a near plane of at
    /// least [`MIN_CASCADE_NEAR`], so a zero near plane still yields finite splits.
    pub fn compute_splits(
        num_cascades: u32,
        near: f32,
        far: f32,
        lambda: f32,
    ) -> [f32; MAX_CASCADES] {
        let count = (num_cascades as usize).clamp(1, MAX_CASCADES);
        let lambda = lambda.clamp(0.0, 1.0);
        let far = far.max(near + MIN_CASCADE_DEPTH_RANGE);
        let log_near = near.max(MIN_CASCADE_NEAR);
        let mut splits = [far; MAX_CASCADES];

        for (k, split) in splits.iter_mut().enumerate().take(count) {
            let p = (k + 1) as f32 / count as f32;
            let uniform_split = near + (far - near) * p;
            *split = if lambda > 0.0 {
                let log_split = log_near * (far / log_near).powf(p);
                lambda * log_split + (1.0 - lambda) * uniform_split
            } else {
                uniform_split
            };
        }
        splits[count - 1] = far;

        splits
    }

    /// Fits `num_cascades` orthographic cascades around the camera frustum for a
    /// light travelling along `light_dir`.
    ///
    /// Near and far planes are clamped to [`MIN_CASCADE_NEAR`] and a depth range of
    /// at least [`MIN_CASCADE_DEPTH_RANGE`] before fitting.
    pub fn compute_cascades(
        &self,
        camera: &CameraState,
        light_dir: Vec3,
        num_cascades: u32,
    ) -> CascadeSet {
        let count = (num_cascades as usize).clamp(1, MAX_CASCADES);
        let near = camera.near.max(MIN_CASCADE_NEAR);
        let far = camera.far.max(near + MIN_CASCADE_DEPTH_RANGE);
        let camera = CameraState {
            near,
            far,
            ..*camera
        };
        let splits = Self::compute_splits(count as u32, near, far, self.lambda);
        let dir = light_dir.normalize_or(Vec3::NEG_Y);

        let inv_view_proj = camera.view_projection().inverse();
        let corners = frustum_corners(&inv_view_proj);
        let camera_dir = camera.direction.normalize_or(Vec3::NEG_Z);

        // Every far corner shares the same angle to the view axis.
        let far_ray = (corners[4] - camera.position).normalize_or(camera_dir);
        let cosine = far_ray.dot(camera_dir).max(f32::EPSILON);
        let sec_sq = 1.0 / (cosine * cosine);

        let up = if dir.dot(Vec3::Y).abs() > 0.99 {
            Vec3::Z
        } else {
            Vec3::Y
        };

        let mut set = CascadeSet {
            splits: Vec4::from_array(splits),
            ..CascadeSet::default()
        };

        let depth_range = far - near;
        let mut previous = near;
        for (i, &split) in splits.iter().enumerate().take(count) {
            let t_near = (previous - near) / depth_range;
            let t_far = (split - near) / depth_range;
            let mut slice = [Vec3::ZERO; 8];
            for edge in 0..4 {
                let ray = corners[edge + 4] - corners[edge];
                slice[edge] = corners[edge] + ray * t_near;
                slice[edge + 4] = corners[edge] + ray * t_far;
            }

            // May land past the slice; the radius grows to cover it.
            let center_distance = 0.5 * (previous + split) * sec_sq;
            let center = camera.position + camera_dir * center_distance;
            let radius = self.slice_radius(&slice, center).max(1e-4);

            let view = Mat4::look_at_rh(center - dir * (3.0 * radius), center, up);
            let ortho = Mat4::orthographic_rh(-radius, radius, -radius, radius, 0.0, 4.0 * radius);
            set.view_proj[i] = self.snap_to_texels(ortho, view) * view;
            previous = split;
        }

        set
    }

    fn slice_radius(&self, slice: &[Vec3; 8], center: Vec3) -> f32 {
        slice.iter().fold(0.0f32, |radius, corner| {
            let offset = *corner - center;
            let extent = match self.bounds {
                CascadeBounds::AxisDeviation => offset.abs().max_element(),
                CascadeBounds::Sphere => offset.length(),
            };
            radius.max(extent)
        })
    }

    /// Shifts the projection so the world origin lands on a whole texel.
    fn snap_to_texels(&self, mut ortho: Mat4, view: Mat4) -> Mat4 {
        let half_res = self.resolution as f32 * 0.5;
        let origin = (ortho * view) * Vec4::W * half_res;
        let rounded = origin.round();
        let mut offset = (rounded - origin) * (2.0 / self.resolution as f32);
        offset.z = 0.0;
        offset.w = 0.0;
        ortho.w_axis += offset;
        ortho
    }
}

impl Default for CascadeCalculator {
    fn default() -> Self {
        Self::from_settings(&ShadowSettings::default())
    }
}

/// World-space frustum corners: near plane `[0..4]`, far plane `[4..8]`, matching order.
fn frustum_corners(inv_view_proj: &Mat4) -> [Vec3; 8] {
    const NDC: [(f32, f32); 4] = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

    let mut corners = [Vec3::ZERO; 8];
    for (i, (x, y)) in NDC.iter().enumerate() {
        corners[i] = inv_view_proj.project_point3(Vec3::new(*x, *y, 0.0));
        corners[i + 4] = inv_view_proj.project_point3(Vec3::new(*x, *y, 1.0));
    }
    corners
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_camera() -> CameraState {
        CameraState::looking_at(Vec3::new(0.0, 5.0, 10.0), Vec3::ZERO, 16.0 / 9.0)
    }

    #[test]
    fn test_split_calculation() {
        let splits = CascadeCalculator::compute_splits(4, 0.1, 100.0, 0.5);
        assert!(splits[0] > 0.1);
        assert!(splits[0] < splits[1]);
        assert!(splits[1] < splits[2]);
        assert!(splits[2] < splits[3]);
        assert_eq!(splits[3], 100.0);
    }

    #[test]
    fn unused_splits_hold_far_plane() {
        let splits = CascadeCalculator::compute_splits(2, 0.5, 50.0, 0.75);
        assert!(splits[0] < 50.0);
        assert_eq!(&splits[1..], &[50.0, 50.0, 50.0]);
    }

    #[test]
    fn uniform_splits_are_evenly_spaced() {
        let splits = CascadeCalculator::compute_splits(4, 0.0, 100.0, 0.0);
        assert_relative_eq!(splits[0], 25.0, epsilon = 1e-4);
        assert_relative_eq!(splits[1], 50.0, epsilon = 1e-4);
        assert_relative_eq!(splits[2], 75.0, epsilon = 1e-4);
        assert_eq!(splits[3], 100.0);
    }

    #[test]
    fn zero_near_plane_keeps_log_splits_finite() {
        let splits = CascadeCalculator::compute_splits(4, 0.0, 100.0, 0.5);
        assert!(splits.iter().all(|split| split.is_finite()));
        for pair in splits.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(splits[3], 100.0);
    }

    #[test]
    fn inverted_depth_range_still_increases() {
        let splits = CascadeCalculator::compute_splits(2, 10.0, 5.0, 0.5);
        assert!(splits[0] > 10.0);
        assert!(splits[0] < splits[1]);
        assert_relative_eq!(splits[1], 10.0 + MIN_CASCADE_DEPTH_RANGE);
    }

    #[test]
    fn cascade_origin_is_texel_aligned() {
        let calculator = CascadeCalculator::new(0.5, 2048);
        let set = calculator.compute_cascades(&test_camera(), Vec3::new(-0.5, -1.0, -0.3), 4);
        for view_proj in &set.view_proj {
            let origin = *view_proj * Vec4::W * 1024.0;
            assert_relative_eq!(origin.x, origin.x.round(), epsilon = 1e-2);
            assert_relative_eq!(origin.y, origin.y.round(), epsilon = 1e-2);
        }
    }

    #[test]
    fn vertical_light_uses_fallback_up_axis() {
        let calculator = CascadeCalculator::default();
        let set = calculator.compute_cascades(&test_camera(), Vec3::NEG_Y, 2);
        for view_proj in &set.view_proj[..2] {
            assert!(view_proj.is_finite());
        }
        assert_eq!(set.view_proj[2], Mat4::IDENTITY);
    }

    #[test]
    fn sphere_bounds_are_never_tighter() {
        let camera = test_camera();
        let dir = Vec3::new(0.3, -1.0, 0.2);
        let axis = CascadeCalculator::new(0.5, 1024).compute_cascades(&camera, dir, 1);
        let sphere = CascadeCalculator::new(0.5, 1024)
            .with_bounds(CascadeBounds::Sphere)
            .compute_cascades(&camera, dir, 1);
        // Orthographic x scale is 1/r, so a larger radius gives a smaller entry.
        assert!(sphere.view_proj[0].x_axis.length() <= axis.view_proj[0].x_axis.length() + 1e-6);
    }
}
