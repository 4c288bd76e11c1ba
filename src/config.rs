//! Configuration defaults and the serializable renderer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum number of cascades a directional light can be split into.
pub const MAX_CASCADES: usize = 4;

/// Number of faces rendered for an omnidirectional (cube) shadow.
pub const CUBE_FACES: u32 = 6;

/// Default point light pool size.
pub const DEFAULT_MAX_POINT_LIGHTS: u16 = 16;

/// Default number of point lights that may cast shadows simultaneously.
pub const DEFAULT_MAX_POINT_SHADOWS: u16 = 16;

/// Default directional light pool size.
pub const DEFAULT_MAX_DIRECTIONAL_LIGHTS: u16 = 4;

/// Default number of shadow-casting directional lights.
pub const DEFAULT_MAX_DIRECTIONAL_SHADOWS: u16 = 4;

/// Default cube shadow map resolution (per face).
pub const DEFAULT_POINT_MAP_RESOLUTION: u32 = 512;

/// Default cascade resolution (per layer).
pub const DEFAULT_DIRECTIONAL_MAP_RESOLUTION: u32 = 2048;

/// Default blend between logarithmic (1.0) and uniform (0.0) cascade splits.
pub const DEFAULT_SPLIT_LAMBDA: f32 = 0.5;

/// Near plane used for the cube shadow projection.
pub const POINT_SHADOW_NEAR: f32 = 0.3;

/// Smallest camera near plane used for cascade fitting.
pub const MIN_CASCADE_NEAR: f32 = 1e-3;

/// Smallest camera depth range used for cascade fitting.
pub const MIN_CASCADE_DEPTH_RANGE: f32 = 1e-2;

/// Swapchain images requested by default (triple buffering).
pub const DEFAULT_FRAMES_IN_FLIGHT: u32 = 3;

/// Upper bound on a single in-flight fence wait before the GPU is declared hung.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a single swapchain image acquisition.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frame budget used for the over-budget warning (60 Hz).
pub const DEFAULT_FRAME_BUDGET_MS: f32 = 1000.0 / 60.0;

/// Capacities of the light and shadow pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightCapacity {
    pub point_lights: u16,
    pub point_shadows: u16,
    pub directional_lights: u16,
    pub directional_shadows: u16,
}

impl Default for LightCapacity {
    fn default() -> Self {
        Self {
            point_lights: DEFAULT_MAX_POINT_LIGHTS,
            point_shadows: DEFAULT_MAX_POINT_SHADOWS,
            directional_lights: DEFAULT_MAX_DIRECTIONAL_LIGHTS,
            directional_shadows: DEFAULT_MAX_DIRECTIONAL_SHADOWS,
        }
    }
}

/// How the radius of a cascade's bounding volume is estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CascadeBounds {
    /// Largest absolute per-axis deviation of the slice corners from the centre.
    #[default]
    AxisDeviation,
    /// Largest Euclidean distance of the slice corners from the centre.
    Sphere,
}

/// Shadow map quality settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShadowSettings {
    /// Cube face resolution for point light shadows.
    pub point_resolution: u32,
    /// Layer resolution for directional cascades.
    pub directional_resolution: u32,
    /// Lambda for split calculation (0 = uniform, 1 = logarithmic).
    pub split_lambda: f32,
    /// Constant depth bias applied while rendering shadow casters.
    pub depth_bias_constant: f32,
    /// Slope-scaled depth bias applied while rendering shadow casters.
    pub depth_bias_slope: f32,
    /// Cascade bounding estimate.
    pub cascade_bounds: CascadeBounds,
}

impl Default for ShadowSettings {
    fn default() -> Self {
        Self {
            point_resolution: DEFAULT_POINT_MAP_RESOLUTION,
            directional_resolution: DEFAULT_DIRECTIONAL_MAP_RESOLUTION,
            split_lambda: DEFAULT_SPLIT_LAMBDA,
            depth_bias_constant: 1.25,
            depth_bias_slope: 1.75,
            cascade_bounds: CascadeBounds::AxisDeviation,
        }
    }
}

impl ShadowSettings {
    /// High quality preset
    pub fn high_quality() -> Self {
        Self {
            point_resolution: 1024,
            directional_resolution: 4096,
            split_lambda: 0.8,
            ..Self::default()
        }
    }

    /// Performance preset
    pub fn performance() -> Self {
        Self {
            point_resolution: 256,
            directional_resolution: 1024,
            split_lambda: 0.5,
            ..Self::default()
        }
    }
}

/// Frame pacing and synchronization settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameConfig {
    /// Minimum number of swapchain images requested.
    pub frames_in_flight: u32,
    /// Diagnostic timeout for a single in-flight fence wait.
    pub fence_timeout: Duration,
    /// Timeout for a single swapchain acquisition.
    pub acquire_timeout: Duration,
    /// CPU time above which a frame is reported as over budget.
    pub frame_budget_ms: f32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            frame_budget_ms: DEFAULT_FRAME_BUDGET_MS,
        }
    }
}

/// Complete configuration consumed by [`crate::FrameDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RendererConfig {
    pub capacity: LightCapacity,
    pub shadows: ShadowSettings,
    pub frames: FrameConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_capacity_matches_observed_configuration() {
        let capacity = LightCapacity::default();
        assert_eq!(capacity.point_lights, 16);
        assert_eq!(capacity.point_shadows, 16);
        assert_eq!(capacity.directional_lights, 4);
        assert_eq!(capacity.directional_shadows, 4);
    }

    #[test]
    fn presets_differ_in_resolution() {
        assert_eq!(ShadowSettings::high_quality().directional_resolution, 4096);
        assert_eq!(ShadowSettings::performance().directional_resolution, 1024);
        assert_eq!(
            ShadowSettings::default().cascade_bounds,
            CascadeBounds::AxisDeviation
        );
    }
}
