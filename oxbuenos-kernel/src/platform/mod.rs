//! Services the process core consumes from the rest of the kernel.
//!
//! Scheduling, context switching, interrupt control, the hardware TLB, the
//! kernel view of physical memory and the filesystem live outside this crate.
//! A board support package implements the traits below; [`mock`] implements
//! them on a development host.

use crate::context::UserContext;
use crate::param::PAGE_SIZE;
use crate::proc::ProcessId;
use crate::vm::{PhysFrame, TlbEntry};
use alloc::boxed::Box;
use core::fmt;
use core::ops::Range;
use num_enum::IntoPrimitive;

#[cfg(any(test, feature = "std"))]
pub mod mock;

/// Index of a thread in the scheduler's thread table
pub type ThreadId = usize;

/// Body of a newly created kernel thread
pub type ThreadFn = Box<dyn FnOnce() + Send + 'static>;

/// Saved interrupt state, as returned when interrupts are disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct IntrStatus(u32);

impl IntrStatus {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Key a thread can sleep on until someone wakes every sleeper of that key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitKey {
    /// Threads joining a process sleep on its process table slot
    Process(ProcessId),
}

/// Hardware state latched by the CPU when a TLB exception is raised
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbExceptionState {
    /// Faulting virtual address
    pub badvaddr: u32,
    /// Virtual page pair number of the faulting address
    pub badvpn2: u32,
    /// Address space id active when the fault happened
    pub asid: u8,
}

impl TlbExceptionState {
    #[must_use]
    pub const fn for_address(badvaddr: u32, asid: u8) -> Self {
        Self {
            badvaddr,
            badvpn2: badvaddr >> 13,
            asid,
        }
    }
}

pub trait Interrupts {
    /// Disable interrupts, returning the state they were in before
    fn interrupt_disable(&self) -> IntrStatus;

    fn interrupt_set_state(&self, status: IntrStatus);
}

pub trait Threads {
    fn current_thread(&self) -> ThreadId;

    /// Create a thread that will run `entry` once started with [`Threads::thread_run`].
    /// Returns `None` if the thread table is full.
    fn thread_create(&self, entry: ThreadFn) -> Option<ThreadId>;

    fn thread_run(&self, thread: ThreadId);

    /// Give up the CPU. A thread that has added itself to a sleep queue does
    /// not run again until it is woken.
    fn thread_switch(&self);

    /// Retire the calling thread
    fn thread_finish(&self) -> !;

    /// Leave kernel mode and continue the calling thread in user mode with `context`
    fn goto_userland(&self, context: &UserContext) -> !;
}

pub trait SleepQueue {
    /// Register the calling thread as sleeping on `key`. It stops running at
    /// its next [`Threads::thread_switch`].
    fn sleepq_add(&self, key: WaitKey);

    fn sleepq_wake_all(&self, key: WaitKey);
}

/// Counting semaphores of the kernel
pub trait Semaphores {
    /// Handle to a semaphore, cheap to clone
    type Semaphore: Clone + Send + Sync;

    fn semaphore_create(&self, value: i32) -> Option<Self::Semaphore>;

    /// Decrement, blocking while the count is negative
    fn semaphore_p(&self, semaphore: &Self::Semaphore);

    /// Increment, waking one blocked thread if there is any
    fn semaphore_v(&self, semaphore: &Self::Semaphore);

    /// Current count. A negative count is the number of blocked threads.
    fn semaphore_value(&self, semaphore: &Self::Semaphore) -> i32;

    fn semaphore_destroy(&self, semaphore: Self::Semaphore);
}

pub trait Tlb {
    fn tlb_exception_state(&self) -> TlbExceptionState;

    /// Write `entry` into a randomly chosen TLB slot
    fn tlb_write_random(&self, entry: &TlbEntry);
}

pub trait PhysicalMemory {
    /// Frame numbers the kernel may hand out to processes
    fn usable_frames(&self) -> Range<u32>;

    /// Kernel view of a physical page frame
    /// # Safety
    /// `frame` must lie in [`PhysicalMemory::usable_frames`], and the caller must
    /// not hold another reference to the same frame while the returned one is alive.
    #[allow(clippy::mut_from_ref)]
    unsafe fn frame_mut(&self, frame: PhysFrame) -> &mut [u8; PAGE_SIZE];
}

/// Handle of a file opened through the [`Vfs`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct OpenFile(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(i32)]
pub enum VfsError {
    NotOpen = -2,
    NotFound = -6,
    /// For example a seek past the end of the file
    InvalidParams = -8,
}

impl fmt::Display for VfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            VfsError::NotOpen => "file is not open",
            VfsError::NotFound => "no such file",
            VfsError::InvalidParams => "invalid parameters",
        };
        f.write_str(reason)
    }
}

pub trait Vfs {
    fn vfs_open(&self, path: &str) -> Result<OpenFile, VfsError>;

    fn vfs_close(&self, file: OpenFile) -> Result<(), VfsError>;

    fn vfs_seek(&self, file: OpenFile, position: u32) -> Result<(), VfsError>;

    /// Read into `buffer`, returning the number of bytes read (0 at end of file)
    fn vfs_read(&self, file: OpenFile, buffer: &mut [u8]) -> Result<usize, VfsError>;

    fn vfs_write(&self, file: OpenFile, buffer: &[u8]) -> Result<usize, VfsError>;
}

/// Everything the process core needs from the machine it runs on
pub trait Platform:
    Interrupts + Threads + SleepQueue + Semaphores + Tlb + PhysicalMemory + Vfs + Send + Sync + 'static
{
}

impl<T> Platform for T where
    T: Interrupts
        + Threads
        + SleepQueue
        + Semaphores
        + Tlb
        + PhysicalMemory
        + Vfs
        + Send
        + Sync
        + 'static
{
}
