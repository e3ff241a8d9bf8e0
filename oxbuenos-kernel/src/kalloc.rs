use crate::platform::Interrupts;
use crate::sync::SpinLock;
use crate::vm::PhysFrame;
use alloc::vec::Vec;
use core::ops::Range;
use log::{debug, trace};

/// Hands out physical page frames to process address spaces
pub(crate) struct FrameAllocator {
    freelist: SpinLock<Vec<PhysFrame>>,
}

impl FrameAllocator {
    /// Put every frame in `frames` on the freelist. Frame 0 is never used.
    pub fn new(frames: Range<u32>) -> Self {
        let start = core::cmp::max(frames.start, 1);
        // Popped from the back, so the lowest frames go out first
        let freelist: Vec<PhysFrame> = (start..frames.end).rev().map(PhysFrame::from_pfn).collect();
        debug!("Initializing frame allocator with {} frames", freelist.len());
        Self {
            freelist: SpinLock::new(freelist),
        }
    }

    pub fn alloc<I: Interrupts + ?Sized>(&self, interrupts: &I) -> Option<PhysFrame> {
        let frame = self.freelist.lock(interrupts).pop();
        if frame.is_none() {
            debug!("Out of physical frames");
        }
        frame
    }

    /// Return a frame from [`FrameAllocator::alloc`]
    pub fn free<I: Interrupts + ?Sized>(&self, interrupts: &I, frame: PhysFrame) {
        assert_ne!(frame.pfn(), 0, "kfree: frame 0");
        let mut freelist = self.freelist.lock(interrupts);
        debug_assert!(!freelist.contains(&frame), "kfree: double free of frame {}", frame.pfn());
        trace!("kfree: frame {}", frame.pfn());
        freelist.push(frame);
    }

    pub fn free_count<I: Interrupts + ?Sized>(&self, interrupts: &I) -> usize {
        self.freelist.lock(interrupts).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::IntrStatus;

    struct NoInterrupts;

    impl Interrupts for NoInterrupts {
        fn interrupt_disable(&self) -> IntrStatus {
            IntrStatus::from_raw(0)
        }

        fn interrupt_set_state(&self, _status: IntrStatus) {}
    }

    #[test]
    fn hands_out_lowest_frames_first() {
        let allocator = FrameAllocator::new(0..4);
        assert_eq!(allocator.free_count(&NoInterrupts), 3);
        assert_eq!(allocator.alloc(&NoInterrupts), Some(PhysFrame::from_pfn(1)));
        assert_eq!(allocator.alloc(&NoInterrupts), Some(PhysFrame::from_pfn(2)));
        assert_eq!(allocator.alloc(&NoInterrupts), Some(PhysFrame::from_pfn(3)));
        assert_eq!(allocator.alloc(&NoInterrupts), None);
    }

    #[test]
    fn freed_frames_are_reused() {
        let allocator = FrameAllocator::new(1..3);
        let first = allocator.alloc(&NoInterrupts).unwrap();
        let _second = allocator.alloc(&NoInterrupts).unwrap();
        assert_eq!(allocator.alloc(&NoInterrupts), None);
        allocator.free(&NoInterrupts, first);
        assert_eq!(allocator.free_count(&NoInterrupts), 1);
        assert_eq!(allocator.alloc(&NoInterrupts), Some(first));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_caught() {
        let allocator = FrameAllocator::new(1..3);
        let frame = allocator.alloc(&NoInterrupts).unwrap();
        allocator.free(&NoInterrupts, frame);
        allocator.free(&NoInterrupts, frame);
    }
}
