#![cfg_attr(not(any(test, feature = "std")), no_std)]

/*
   Copyright 2024 Claire Moore

   Licensed under the Apache License, Version 2.0 (the "License");
   you may not use this file except in compliance with the License.
   You may obtain a copy of the License at

       http://www.apache.org/licenses/LICENSE-2.0

   Unless required by applicable law or agreed to in writing, software
   distributed under the License is distributed on an "AS IS" BASIS,
   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
   See the License for the specific language governing permissions and
   limitations under the License.
*/

//! Process management and TLB fault handling for a single-CPU MIPS32 kernel
//! with a software-managed TLB.
//!
//! [`Kernel`] owns the process table, the thread binding table, the frame
//! allocator and the named semaphore table. Everything else it needs (threads,
//! interrupts, the TLB, the filesystem) comes from a [`platform::Platform`].

extern crate alloc;

pub mod context;
pub mod elf;
pub mod kalloc;
pub mod name;
pub mod param;
pub mod platform;
pub mod println;
pub mod proc;
pub mod sync;
pub mod syscall;
pub mod tlb;
pub mod usr_sem;
pub mod vm;

use crate::kalloc::FrameAllocator;
use crate::param::{CONFIG_MAX_THREADS, MAX_USR_SEM, PROCESS_MAX_PROCESSES};
use crate::platform::Platform;
use crate::proc::{Pcb, ThreadEntry};
use crate::sync::SpinLock;
use crate::usr_sem::UsrSemBlock;
use log::info;

pub struct Kernel<P: Platform> {
    platform: P,
    frames: FrameAllocator,
    process_table: SpinLock<[Pcb; PROCESS_MAX_PROCESSES]>,
    thread_table: [SpinLock<ThreadEntry>; CONFIG_MAX_THREADS],
    usr_sem_table: SpinLock<[UsrSemBlock<P::Semaphore>; MAX_USR_SEM]>,
}

impl<P: Platform> Kernel<P> {
    /// Set up empty process, thread and semaphore tables on top of `platform`
    pub fn new(platform: P) -> Self {
        let usable = platform.usable_frames();
        info!(
            "process core: {} processes, {} threads, frames {}..{}",
            PROCESS_MAX_PROCESSES, CONFIG_MAX_THREADS, usable.start, usable.end
        );
        Self {
            frames: FrameAllocator::new(usable),
            process_table: SpinLock::new([Pcb::FREE; PROCESS_MAX_PROCESSES]),
            thread_table: core::array::from_fn(|_| SpinLock::new(ThreadEntry::default())),
            usr_sem_table: SpinLock::new(core::array::from_fn(|_| UsrSemBlock::default())),
            platform,
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Number of physical frames not mapped by any process
    pub fn free_frames(&self) -> usize {
        self.frames.free_count(&self.platform)
    }
}
