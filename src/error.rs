//! Error types for the renderer core.
//!
//! Construction-time GPU failures are reported through [`RenderError`] and the
//! [`Result`] alias. Per-frame transient conditions (pool exhaustion, stale
//! handles, an out-of-date swapchain) never surface here.

use std::fmt;

/// Main error type for fallible renderer operations.
#[derive(Debug)]
pub enum RenderError {
    /// A Vulkan API call failed.
    VulkanError(String),
    /// An I/O operation failed.
    IoError(std::io::Error),
    /// A GPU object could not be created.
    ResourceCreationFailed(String),
    /// Swapchain creation failed.
    SwapchainCreationFailed(String),
    /// Failed to acquire the next swapchain image.
    FrameAcquisitionFailed(String),
    /// An in-flight fence did not signal within the diagnostic timeout.
    GpuTimeout(String),
    /// A handle passed to the provider does not name a live object.
    UnknownHandle(String),
    /// The frame recorder reported a failure while recording.
    RecordingFailed(String),
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::VulkanError(msg) => write!(f, "Vulkan error: {msg}"),
            Self::IoError(err) => write!(f, "IO error: {err}"),
            Self::ResourceCreationFailed(msg) => write!(f, "Resource creation failed: {msg}"),
            Self::SwapchainCreationFailed(msg) => write!(f, "Swapchain creation failed: {msg}"),
            Self::FrameAcquisitionFailed(msg) => write!(f, "Frame acquisition failed: {msg}"),
            Self::GpuTimeout(msg) => write!(f, "GPU timeout: {msg}"),
            Self::UnknownHandle(msg) => write!(f, "Unknown handle: {msg}"),
            Self::RecordingFailed(msg) => write!(f, "Command recording failed: {msg}"),
        }
    }
}

impl std::error::Error for RenderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IoError(err) => Some(err),
            _ => None,
        }
    }
}

/// Convenient Result type alias for renderer operations.
pub type Result<T> = std::result::Result<T, RenderError>;

impl From<std::io::Error> for RenderError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err)
    }
}

impl From<ash::vk::Result> for RenderError {
    fn from(result: ash::vk::Result) -> Self {
        Self::VulkanError(format!("{result:?}"))
    }
}

/// Rejection reasons for light registry mutators.
///
/// These are reported to the caller and never escalate into panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightError {
    /// The handle is malformed, stale, or refers to a free slot.
    InvalidHandle,
    /// The operation does not apply to this kind of light.
    KindMismatch {
        expected: crate::light::LightKind,
        found: crate::light::LightKind,
    },
    /// The supplied value cannot be stored (zero direction, non-finite input).
    InvalidArgument(&'static str),
}

impl fmt::Display for LightError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidHandle => write!(f, "invalid or stale light handle"),
            Self::KindMismatch { expected, found } => {
                write!(f, "operation expects a {expected:?} light, got {found:?}")
            }
            Self::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
        }
    }
}

impl std::error::Error for LightError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RenderError::GpuTimeout("fence 3".to_string());
        assert!(err.to_string().contains("GPU timeout"));
    }

    #[test]
    fn test_vk_result_conversion() {
        let err: RenderError = ash::vk::Result::ERROR_DEVICE_LOST.into();
        assert!(matches!(err, RenderError::VulkanError(ref msg) if msg.contains("DEVICE_LOST")));
    }

    #[test]
    fn test_light_error_display() {
        let err = LightError::KindMismatch {
            expected: crate::light::LightKind::Point,
            found: crate::light::LightKind::Directional,
        };
        assert!(err.to_string().contains("Point"));
    }
}
