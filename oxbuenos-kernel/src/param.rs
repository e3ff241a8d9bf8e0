//! Compile-time kernel parameters.

/// The size of pages used in oxbuenos
pub const PAGE_SIZE: usize = 4096;

/// Number of page-pair entries one page table can hold (one page worth of entries)
pub const PAGETABLE_ENTRIES: usize = 340;

/// First address past the user segment (kuseg ends where kseg0 begins)
pub const USERLAND_END: u32 = 0x8000_0000;

/// Initial stack pointer of every user process
pub const USERLAND_STACK_TOP: u32 = 0x7fff_effc;

/// Stack size of a user process, in pages
pub const CONFIG_USERLAND_STACK_SIZE: usize = 1;

pub const PROCESS_MAX_PROCESSES: usize = 32;
pub const PROCESS_MAX_FILELENGTH: usize = 256;
pub const CONFIG_MAX_OPEN_FILES: usize = 16;

/// Size of the thread table. Kernel threads count too, so this is larger than the process table.
pub const CONFIG_MAX_THREADS: usize = 64;

pub const MAX_USR_SEM: usize = 32;
pub const MAX_USR_SEM_NAME: usize = 32;

/// Exit code of a process killed by a fault it caused.
pub const FAULT_EXIT_CODE: i32 = 255;
