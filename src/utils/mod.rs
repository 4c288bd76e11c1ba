//! Helpers shared by the frame loop and the shadow passes.

pub mod timing;

pub use timing::{FrameBudget, FrameTimings, SectionTimer};
