//! A prototype Vulkan renderer built on [Ash](https://crates.io/crates/ash).
//!
//! The crate owns the full lifecycle of a single-window renderer: instance
//! and surface creation, device selection, a dedicated-allocation resource
//! allocator, swapchain management with automatic recreation, descriptor and
//! pipeline construction helpers, and a single-frame-in-flight submission
//! loop driven through the [`Scene`] trait.
//!
//! Typical usage:
//!
//! 1. Create a [`Renderer`] from anything implementing [`RenderWindow`].
//! 2. Build meshes, textures, descriptors and the pipeline through
//!    [`Renderer::allocator`] and the [`renderer::pipeline`] helpers, using
//!    [`Renderer::with_sync_transfer`] for uploads.
//! 3. Call [`Renderer::run_frame`] with a [`Scene`] once per frame.

mod error;
pub mod renderer;
mod timer;
mod window;

pub use error::{RendererError, RendererResult};
pub use renderer::*;
pub use timer::Timer;
pub use window::RenderWindow;
