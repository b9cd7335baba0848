// Frame scheduler
//
// Per frame, for slot = frame_count % FRAMES_IN_FLIGHT:
//   1. wait on the slot's fence
//   2. acquire an image (stale -> rebuild, skip this frame)
//   3. reset the slot's fence
//   4. submit the command buffer of the *acquired image*
//   5. present (stale -> rebuild after the fact)
//   6. advance the frame counter
//
// The fence wait in step 1 is the only thing bounding how far the CPU runs
// ahead of the GPU. The fence is reset after a successful acquire, never
// before: a skipped frame must leave it signaled or the next wait hangs.

use anyhow::Result;

use crate::backend::sync::FRAMES_IN_FLIGHT;

/// Result of asking the presentation engine for an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Image(u32),
    /// Out of date or suboptimal: rebuild before rendering again.
    Stale,
}

/// What presentation reported about the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceStatus {
    Optimal,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Submitted and presented; the swapchain is still good.
    Presented { slot: usize, image_index: u32 },
    /// Presented, then rebuilt because present reported staleness.
    PresentedStale { slot: usize, image_index: u32 },
    /// Acquire reported staleness; rebuilt, nothing submitted.
    Skipped,
}

/// The GPU side the scheduler drives. Slot indices are always
/// `< FRAMES_IN_FLIGHT`.
pub trait FrameTarget {
    /// Block until the slot's previous submission has completed.
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;

    /// Return the slot's fence to unsignaled so the next submit can arm it.
    fn reset_slot(&mut self, slot: usize) -> Result<()>;

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome>;

    /// Submit the command buffer recorded for `image_index`, waiting on the
    /// slot's image-available signal and arming the slot's fence.
    fn submit(&mut self, slot: usize, image_index: u32) -> Result<()>;

    fn present(&mut self, slot: usize, image_index: u32) -> Result<SurfaceStatus>;

    /// Tear down and recreate the swapchain and everything bound to it.
    fn rebuild_swapchain(&mut self) -> Result<()>;

    fn wait_idle(&mut self) -> Result<()>;

    /// Destroy every GPU object. Only called once the device is idle.
    fn release_resources(&mut self);
}

#[derive(Debug, Default)]
pub struct FrameScheduler {
    frame_count: u64,
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames submitted so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn current_slot(&self) -> usize {
        (self.frame_count % FRAMES_IN_FLIGHT as u64) as usize
    }

    /// Run one iteration of the frame loop against `target`.
    pub fn draw_frame<T: FrameTarget>(&mut self, target: &mut T) -> Result<FrameOutcome> {
        let slot = self.current_slot();

        target.wait_for_slot(slot)?;

        let image_index = match target.acquire_image(slot)? {
            AcquireOutcome::Image(index) => index,
            AcquireOutcome::Stale => {
                log::debug!("Acquire reported a stale swapchain, rebuilding");
                target.rebuild_swapchain()?;
                // Same slot next time; its fence is still signaled
                return Ok(FrameOutcome::Skipped);
            }
        };

        target.reset_slot(slot)?;
        target.submit(slot, image_index)?;

        let status = target.present(slot, image_index)?;

        self.frame_count += 1;
        log::trace!(
            "Frame {} presented (slot {}, image {})",
            self.frame_count,
            slot,
            image_index
        );

        match status {
            SurfaceStatus::Optimal => Ok(FrameOutcome::Presented { slot, image_index }),
            SurfaceStatus::Stale => {
                log::debug!("Present reported a stale swapchain, rebuilding");
                target.rebuild_swapchain()?;
                Ok(FrameOutcome::PresentedStale { slot, image_index })
            }
        }
    }
}

/// Drain the GPU, then destroy everything. Nothing is destroyed if the
/// idle wait fails.
pub fn shutdown<T: FrameTarget>(target: &mut T) -> Result<()> {
    log::info!("Shutting down: waiting for the device to go idle");
    target.wait_idle()?;
    target.release_resources();
    Ok(())
}
