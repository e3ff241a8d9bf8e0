//! The process table and the binding of kernel threads to processes.

use crate::context::UserContext;
use crate::name::FixedName;
use crate::param::{CONFIG_MAX_OPEN_FILES, PROCESS_MAX_FILELENGTH, PROCESS_MAX_PROCESSES};
use crate::platform::{OpenFile, Platform, ThreadId};
use crate::vm::PageTable;
use crate::Kernel;
use alloc::boxed::Box;
use core::fmt;
use log::warn;
use num_enum::IntoPrimitive;

mod exit;
mod files;
mod fork;
mod heap;
mod start;

pub use heap::HeapError;

/// Index of a process in the process table
pub type ProcessId = usize;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    #[default]
    Free,
    Running,
    /// Finished, waiting for its parent to collect the return value
    Zombie,
}

/// Failures reported to the caller of a process operation. The discriminants
/// are the values user programs see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(i32)]
pub enum ProcessError {
    PtableFull = -1,
    IllegalJoin = -2,
    TtableFull = -3,
    OutOfResources = -4,
    FileTableFull = -5,
    OutOfMemory = -6,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ProcessError::PtableFull => "process table full",
            ProcessError::IllegalJoin => "illegal join",
            ProcessError::TtableFull => "thread table full",
            ProcessError::OutOfResources => "out of kernel resources",
            ProcessError::FileTableFull => "open file table full",
            ProcessError::OutOfMemory => "out of memory",
        };
        f.write_str(reason)
    }
}

/// Process control block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pcb {
    state: ProcessState,
    executable: FixedName<PROCESS_MAX_FILELENGTH>,
    retval: i32,
    parent: Option<ProcessId>,
    heap_end: u32,
    files: [Option<OpenFile>; CONFIG_MAX_OPEN_FILES],
    /// Threads currently inside `process_join` for this process
    joiners: usize,
}

impl Pcb {
    pub const FREE: Pcb = Pcb {
        state: ProcessState::Free,
        executable: FixedName::EMPTY,
        retval: 0,
        parent: None,
        heap_end: 0,
        files: [None; CONFIG_MAX_OPEN_FILES],
        joiners: 0,
    };

    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.state
    }

    #[must_use]
    pub fn executable(&self) -> &str {
        self.executable.as_str()
    }

    #[must_use]
    pub fn retval(&self) -> i32 {
        self.retval
    }

    #[must_use]
    pub fn parent(&self) -> Option<ProcessId> {
        self.parent
    }

    #[must_use]
    pub fn heap_end(&self) -> u32 {
        self.heap_end
    }

    #[must_use]
    pub fn files(&self) -> &[Option<OpenFile>] {
        &self.files
    }

    #[must_use]
    pub fn joiners(&self) -> usize {
        self.joiners
    }
}

/// What the process core knows about one kernel thread
#[derive(Debug, Default)]
pub struct ThreadEntry {
    /// Process this thread runs, if it runs one
    pub process_id: Option<ProcessId>,
    pub pagetable: Option<Box<PageTable>>,
    /// User context saved at the last system call
    pub user_context: UserContext,
}

/// Address space id of the page table owned by `thread`
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn asid_of(thread: ThreadId) -> u8 {
    (thread & 0xff) as u8
}

impl<P: Platform> Kernel<P> {
    /// Claim a free process table slot and mark it running
    pub(crate) fn alloc_process_id(&self) -> Option<ProcessId> {
        let mut table = self.process_table.lock(&self.platform);
        let pid = table.iter().position(|pcb| pcb.state == ProcessState::Free)?;
        table[pid].state = ProcessState::Running;
        Some(pid)
    }

    /// Return a slot claimed by [`Kernel::alloc_process_id`] whose process never started
    pub(crate) fn release_process_id(&self, pid: ProcessId) {
        self.process_table.lock(&self.platform)[pid] = Pcb::FREE;
    }

    /// The process run by the calling thread, if any
    pub fn process_get_current_process(&self) -> Option<ProcessId> {
        let thread = self.platform.current_thread();
        self.thread_table[thread].lock(&self.platform).process_id
    }

    /// The process run by the calling thread. Only process context may call this.
    pub(crate) fn current_process(&self) -> ProcessId {
        self.process_get_current_process()
            .expect("current thread runs no process")
    }

    /// A copy of the process control block of `pid`
    pub fn process_entry(&self, pid: ProcessId) -> Option<Pcb> {
        if pid >= PROCESS_MAX_PROCESSES {
            warn!("process_entry: pid {pid} out of range");
            return None;
        }
        Some(self.process_table.lock(&self.platform)[pid])
    }

    /// The thread running `pid`
    pub fn thread_get_thread_entry_by_pid(&self, pid: ProcessId) -> Option<ThreadId> {
        self.thread_table
            .iter()
            .position(|entry| entry.lock(&self.platform).process_id == Some(pid))
    }
}
