//! Per-frame acquire/record/submit/present protocol.
//!
//! The protocol is written against the small [`FrameBackend`] trait so the
//! ordering rules (present before the fence wait, stale surface reported
//! instead of swallowed) can be exercised without a device.

use crate::error::RendererResult;
use ash::vk;

/// Everything the renderer needs to record one frame.
///
/// The caller keeps ownership of every handle; the protocol only records
/// commands referencing them.
pub struct FrameDraw<'a> {
    pub render_pass: vk::RenderPass,
    pub framebuffers: &'a [vk::Framebuffer],
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub descriptor_set: vk::DescriptorSet,
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_type: vk::IndexType,
    pub index_count: u32,
}

/// Outcome of a completed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// The frame was presented.
    Presented,
    /// The surface no longer matches the swapchain; the caller must rebuild
    /// the swapchain before rendering again.
    SurfaceStale,
}

pub(crate) enum Acquire {
    Image(u32),
    OutOfDate,
}

pub(crate) enum Present {
    Done,
    Stale,
}

/// Device-facing half of the protocol.
pub(crate) trait FrameBackend {
    fn image_count(&self) -> u32;
    fn acquire(&mut self) -> RendererResult<Acquire>;
    fn record_and_submit(&mut self, image_index: u32) -> RendererResult<()>;
    fn present(&mut self, image_index: u32) -> RendererResult<Present>;
    fn wait_and_reset_fence(&mut self) -> RendererResult<()>;
}

/// Single-frame-in-flight submission driver.
///
/// Holds only the predicted next image index, which survives swapchain
/// rebuilds and gets clamped if it no longer fits the new image count.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FrameProtocol {
    next_image_index: u32,
}

impl FrameProtocol {
    /// Runs one frame to completion. Returns [`FrameStatus::SurfaceStale`]
    /// as soon as the backend reports the swapchain out of date, whether at
    /// acquire or at present time.
    pub fn run<B: FrameBackend>(&mut self, backend: &mut B) -> RendererResult<FrameStatus> {
        if self.next_image_index >= backend.image_count() {
            self.next_image_index = 0;
        }

        let image_index = match backend.acquire()? {
            Acquire::Image(index) => index,
            Acquire::OutOfDate => return Ok(FrameStatus::SurfaceStale),
        };

        backend.record_and_submit(image_index)?;

        let presented = backend.present(image_index)?;

        // The submit signalled the frame fence; wait for it even when the
        // present reported a stale surface, so the command buffer is free to
        // reuse on the next frame.
        backend.wait_and_reset_fence()?;

        self.next_image_index = (image_index + 1) % backend.image_count();

        match presented {
            Present::Done => Ok(FrameStatus::Presented),
            Present::Stale => Ok(FrameStatus::SurfaceStale),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RendererError;
    use ash::vk;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Acquire,
        Submit(u32),
        Present(u32),
        WaitFence,
    }

    struct MockBackend {
        image_count: u32,
        acquire_results: Vec<RendererResult<Acquire>>,
        present_result: fn() -> RendererResult<Present>,
        calls: Vec<Call>,
    }

    impl MockBackend {
        fn new(image_count: u32, acquired: u32) -> Self {
            Self {
                image_count,
                acquire_results: vec![Ok(Acquire::Image(acquired))],
                present_result: || Ok(Present::Done),
                calls: Vec::new(),
            }
        }
    }

    impl FrameBackend for MockBackend {
        fn image_count(&self) -> u32 {
            self.image_count
        }

        fn acquire(&mut self) -> RendererResult<Acquire> {
            self.calls.push(Call::Acquire);
            self.acquire_results.remove(0)
        }

        fn record_and_submit(&mut self, image_index: u32) -> RendererResult<()> {
            self.calls.push(Call::Submit(image_index));
            Ok(())
        }

        fn present(&mut self, image_index: u32) -> RendererResult<Present> {
            self.calls.push(Call::Present(image_index));
            (self.present_result)()
        }

        fn wait_and_reset_fence(&mut self) -> RendererResult<()> {
            self.calls.push(Call::WaitFence);
            Ok(())
        }
    }

    #[test]
    fn frame_runs_in_protocol_order() {
        let mut backend = MockBackend::new(3, 1);
        let mut protocol = FrameProtocol::default();

        let status = protocol.run(&mut backend).unwrap();

        assert_eq!(status, FrameStatus::Presented);
        assert_eq!(
            backend.calls,
            vec![
                Call::Acquire,
                Call::Submit(1),
                Call::Present(1),
                Call::WaitFence
            ]
        );
    }

    #[test]
    fn out_of_date_acquire_skips_submission() {
        let mut backend = MockBackend::new(3, 0);
        backend.acquire_results = vec![Ok(Acquire::OutOfDate)];
        let mut protocol = FrameProtocol::default();

        let status = protocol.run(&mut backend).unwrap();

        assert_eq!(status, FrameStatus::SurfaceStale);
        assert_eq!(backend.calls, vec![Call::Acquire]);
    }

    #[test]
    fn stale_present_still_waits_for_the_fence() {
        let mut backend = MockBackend::new(3, 2);
        backend.present_result = || Ok(Present::Stale);
        let mut protocol = FrameProtocol::default();

        let status = protocol.run(&mut backend).unwrap();

        assert_eq!(status, FrameStatus::SurfaceStale);
        assert_eq!(*backend.calls.last().unwrap(), Call::WaitFence);
    }

    #[test]
    fn predicted_index_wraps_after_the_last_image() {
        let mut backend = MockBackend::new(2, 1);
        let mut protocol = FrameProtocol::default();
        protocol.run(&mut backend).unwrap();
        assert_eq!(protocol.next_image_index, 0);
    }

    #[test]
    fn stale_prediction_is_clamped_after_a_rebuild() {
        // Simulate a swapchain rebuild shrinking the image count below the
        // previously predicted index.
        let mut protocol = FrameProtocol { next_image_index: 5 };
        let mut backend = MockBackend::new(2, 0);

        protocol.run(&mut backend).unwrap();

        assert_eq!(protocol.next_image_index, 1);
    }

    #[test]
    fn frames_never_overlap() {
        let mut backend = MockBackend::new(2, 0);
        backend.acquire_results = vec![Ok(Acquire::Image(0)), Ok(Acquire::Image(1))];
        let mut protocol = FrameProtocol::default();

        protocol.run(&mut backend).unwrap();
        protocol.run(&mut backend).unwrap();

        // The fence wait of each frame happens before the next acquire.
        assert_eq!(
            backend.calls,
            vec![
                Call::Acquire,
                Call::Submit(0),
                Call::Present(0),
                Call::WaitFence,
                Call::Acquire,
                Call::Submit(1),
                Call::Present(1),
                Call::WaitFence,
            ]
        );
    }

    #[test]
    fn backend_errors_propagate() {
        let mut backend = MockBackend::new(3, 0);
        backend.acquire_results = vec![Err(RendererError::Vulkan(
            vk::Result::ERROR_DEVICE_LOST,
        ))];
        let mut protocol = FrameProtocol::default();

        assert!(protocol.run(&mut backend).is_err());
    }
}
