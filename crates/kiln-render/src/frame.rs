use ash::vk;
use tracing::{trace, warn};

use crate::backend::{FrameSync, GpuBackend};
use crate::error::{RenderError, VkResultExt};

/// Frames whose GPU work may be outstanding at once.
pub const FRAME_OVERLAP: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    /// The fence has been reset for a submission that has not been made.
    Recording,
    Submitted,
}

/// Per-frame-in-flight state.
pub struct FrameContext {
    pub sync: FrameSync,
    pub state: FrameState,
    /// Staging buffers referenced by this context's last submission.
    pub retired_staging: Vec<vk::Buffer>,
}

pub struct FrameSynchronizer {
    contexts: Vec<FrameContext>,
    current: usize,
    submitted: u64,
}

impl FrameSynchronizer {
    pub fn new<B: GpuBackend>(backend: &mut B) -> Result<Self, RenderError> {
        let mut contexts = Vec::with_capacity(FRAME_OVERLAP);
        for _ in 0..FRAME_OVERLAP {
            let sync = backend.create_frame_sync().vk("vkCreateFence")?;
            contexts.push(FrameContext {
                sync,
                state: FrameState::Idle,
                retired_staging: Vec::new(),
            });
        }
        Ok(Self {
            contexts,
            current: 0,
            submitted: 0,
        })
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    pub fn current(&self) -> &FrameContext {
        &self.contexts[self.current]
    }

    pub fn current_mut(&mut self) -> &mut FrameContext {
        &mut self.contexts[self.current]
    }

    /// Blocks until the current context's previous submission retired, then
    /// frees what that submission kept alive. Does not reset the fence.
    pub fn wait_current<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        timeout_ns: u64,
    ) -> Result<(), RenderError> {
        let ctx = &mut self.contexts[self.current];
        if ctx.state == FrameState::Recording {
            // A failed record or submit left the fence reset with nothing
            // queued to signal it; waiting would never return. The state
            // stays Recording until a submission goes through.
            warn!(frame = self.current, "previous submission failed, skipping fence wait");
        } else {
            backend
                .wait_for_fence(ctx.sync.in_flight, timeout_ns)
                .vk("vkWaitForFences")?;
            ctx.state = FrameState::Idle;
        }
        for buffer in ctx.retired_staging.drain(..) {
            backend.destroy_buffer(buffer);
        }
        Ok(())
    }

    /// Resets the current fence ahead of its submission.
    pub fn begin_submission<B: GpuBackend>(&mut self, backend: &mut B) -> Result<(), RenderError> {
        let ctx = &mut self.contexts[self.current];
        backend
            .reset_fence(ctx.sync.in_flight)
            .vk("vkResetFences")?;
        ctx.state = FrameState::Recording;
        Ok(())
    }

    /// Moves to the next context; only called after a successful submit.
    pub fn advance(&mut self) {
        self.contexts[self.current].state = FrameState::Submitted;
        self.current = (self.current + 1) % FRAME_OVERLAP;
        self.submitted += 1;
        trace!(current = self.current, submitted = self.submitted, "frame advanced");
    }

    /// Submitted contexts whose completion fence has not signaled yet.
    pub fn in_flight<B: GpuBackend>(&self, backend: &mut B) -> Result<usize, RenderError> {
        let mut count = 0;
        for ctx in &self.contexts {
            if ctx.state != FrameState::Submitted {
                continue;
            }
            if !backend
                .fence_signaled(ctx.sync.in_flight)
                .vk("vkGetFenceStatus")?
            {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Called once the device is idle: every retired staging buffer is safe
    /// to free.
    pub fn release_retired<B: GpuBackend>(&mut self, backend: &mut B) {
        for ctx in &mut self.contexts {
            for buffer in ctx.retired_staging.drain(..) {
                backend.destroy_buffer(buffer);
            }
            if ctx.state == FrameState::Submitted {
                ctx.state = FrameState::Idle;
            }
        }
    }

    pub fn destroy<B: GpuBackend>(&mut self, backend: &mut B) {
        self.release_retired(backend);
        for ctx in self.contexts.drain(..) {
            backend.destroy_frame_sync(&ctx.sync);
        }
    }
}
