//! Shadow rendering: cascade fitting for directional lights, per-slot shadow maps
//! and the passes that fill them.

pub mod cascade;
pub mod caster;
pub mod maps;

pub use cascade::{CascadeCalculator, CascadeSet};
pub use caster::{
    CubeFaceViews, Drawable, PointShadowPush, ShadowCaster, ShadowMapState, ShadowShaders,
    MODEL_PUSH_SIZE,
};
pub use maps::{DirectionalShadowMap, PointShadowMap};
