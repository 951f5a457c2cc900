use vulkanalia::vk;

use crate::asset::Topology;
use crate::traits::TraitTag;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the engine can report.
///
/// Object-construction errors are returned after the partially built object
/// has been torn down. Per-frame errors (acquire, submit, present) are logged
/// by the swapchain and never reach the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no memory type satisfies {0:?}")]
    NoMemoryType(vk::MemoryPropertyFlags),
    #[error("out of video memory")]
    OutOfVram,
    #[error("unsupported format {0:?}")]
    UnsupportedFormat(vk::Format),
    #[error("unsupported layout transition {from:?} -> {to:?}")]
    UnsupportedTransition {
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    },
    #[error("no vertex format matches attribute {0:?}")]
    UnsupportedAttribute(TraitTag),
    #[error("unsupported primitive topology {0:?}")]
    UnsupportedTopology(Topology),
    #[error("shader compilation failed: {0}")]
    ShaderCompile(String),
    #[error("descriptor set allocation failed: {0}")]
    DescriptorAllocation(vk::ErrorCode),
    #[error("surface lost")]
    SurfaceLost,
    #[error("swapchain out of date")]
    SwapchainOutOfDate,
    #[error("device lost")]
    DeviceLost,
    #[error("not implemented: {0}")]
    Unimplemented(&'static str),
    #[error("uniform {0:?} has no concrete memory layout")]
    AbstractUniform(TraitTag),
    #[error("descriptor does not describe a pipeline")]
    InvalidPipeline,
    #[error("failed to find a suitable physical device")]
    NoSuitableDevice,
    #[error("missing {0} queue family")]
    MissingQueueFamily(&'static str),
    #[error("texture holds {actual} bytes, expected {expected}")]
    TextureSize { expected: usize, actual: usize },
    #[error("failed to load the Vulkan library: {0}")]
    Loader(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error("vulkan call failed: {0}")]
    Vulkan(vk::ErrorCode),
}

impl From<vk::ErrorCode> for Error {
    fn from(code: vk::ErrorCode) -> Self {
        match code {
            vk::ErrorCode::DEVICE_LOST => Error::DeviceLost,
            vk::ErrorCode::SURFACE_LOST_KHR => Error::SurfaceLost,
            vk::ErrorCode::OUT_OF_DATE_KHR => Error::SwapchainOutOfDate,
            vk::ErrorCode::OUT_OF_DEVICE_MEMORY => Error::OutOfVram,
            other => Error::Vulkan(other),
        }
    }
}

impl Error {
    /// Whether the renderer can keep going after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::DeviceLost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_codes_map_to_engine_errors() {
        assert!(matches!(
            Error::from(vk::ErrorCode::DEVICE_LOST),
            Error::DeviceLost
        ));
        assert!(matches!(
            Error::from(vk::ErrorCode::OUT_OF_DATE_KHR),
            Error::SwapchainOutOfDate
        ));
        assert!(matches!(
            Error::from(vk::ErrorCode::OUT_OF_DEVICE_MEMORY),
            Error::OutOfVram
        ));
        assert!(matches!(
            Error::from(vk::ErrorCode::OUT_OF_HOST_MEMORY),
            Error::Vulkan(_)
        ));
    }

    #[test]
    fn only_device_loss_is_fatal() {
        assert!(Error::DeviceLost.is_fatal());
        assert!(!Error::SwapchainOutOfDate.is_fatal());
        assert!(!Error::Unimplemented("instancing").is_fatal());
    }
}
