use ash::vk;
use thiserror::Error;

pub type RendererResult<T> = Result<T, RendererError>;

/// Crate error type.
#[derive(Debug, Error)]
pub enum RendererError {
    /// Errors coming from calls to Vulkan functions.
    #[error("A Vulkan error occured: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan shared library could not be loaded.
    #[error("Failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    /// Io errors (shader bytecode reads).
    #[error("A io error occured: {0}")]
    Io(#[from] std::io::Error),

    /// The instance reported no physical device at all.
    #[error("No Vulkan physical device found")]
    NoPhysicalDevice,

    /// No enumerated device exposes a queue family supporting both graphics
    /// operations and presentation to the target surface.
    #[error("No device exposes a graphics queue able to present to the surface")]
    NoGraphicsQueue,

    /// No memory type satisfies both the resource requirements and the
    /// requested property flags.
    #[error("No compatible memory type for the requested property flags")]
    NoCompatibleMemoryType,

    /// Initialization errors.
    #[error("An error occured when initializing the renderer: {0}")]
    Init(String),
}
