use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};

/// Interface the renderer expects from the platform window.
///
/// The handle accessors are used exactly once, at surface creation. The
/// reported size is only a fallback for platforms whose surface does not
/// report a fixed current extent.
pub trait RenderWindow: HasRawWindowHandle + HasRawDisplayHandle {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn title(&self) -> &str;
}
