use super::{asid_of, ProcessError, ProcessId};
use crate::context::MipsRegister;
use crate::platform::{Platform, ThreadId};
use crate::vm::{MapError, PageTable, TlbEntry};
use crate::Kernel;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use log::{info, warn};

/// Handed from a forking parent to the thread that becomes its child
struct ForkSetup<S> {
    child: ProcessId,
    parent: ProcessId,
    /// Raised by the child when its address space is a copy of the parent's
    handshake: S,
    failed: Arc<AtomicBool>,
}

impl<P: Platform> Kernel<P> {
    /// Duplicate the calling process. The parent gets the child's pid; the
    /// child resumes after the same system call with 0 in its result register.
    pub fn process_fork(&'static self) -> Result<ProcessId, ProcessError> {
        let parent = self.current_process();
        let Some(child) = self.alloc_process_id() else {
            warn!("process {parent}: fork: process table full");
            return Err(ProcessError::PtableFull);
        };
        {
            let mut table = self.process_table.lock(&self.platform);
            let source = table[parent];
            let pcb = &mut table[child];
            pcb.executable = source.executable;
            pcb.parent = Some(parent);
            pcb.heap_end = source.heap_end;
            pcb.files = source.files;
        }

        let Some(handshake) = self.platform.semaphore_create(0) else {
            warn!("process {parent}: fork: no semaphore left");
            self.release_process_id(child);
            return Err(ProcessError::OutOfResources);
        };
        let failed = Arc::new(AtomicBool::new(false));
        let setup = ForkSetup {
            child,
            parent,
            handshake: handshake.clone(),
            failed: Arc::clone(&failed),
        };
        let Some(thread) = self.platform.thread_create(Box::new(move || {
            self.process_fork_setup(setup);
        })) else {
            warn!("process {parent}: fork: thread table full");
            self.platform.semaphore_destroy(handshake);
            self.release_process_id(child);
            return Err(ProcessError::TtableFull);
        };
        self.platform.thread_run(thread);

        self.platform.semaphore_p(&handshake);
        self.platform.semaphore_destroy(handshake);
        if failed.load(Ordering::Acquire) {
            warn!("process {parent}: fork: out of memory copying into process {child}");
            self.release_process_id(child);
            return Err(ProcessError::OutOfMemory);
        }
        info!("process {parent}: forked process {child} on thread {thread}");
        Ok(child)
    }

    /// Body of the child's thread: copy the parent's memory and context, then enter user mode
    fn process_fork_setup(&self, setup: ForkSetup<P::Semaphore>) -> ! {
        let thread = self.platform.current_thread();
        {
            let mut entry = self.thread_table[thread].lock(&self.platform);
            entry.process_id = Some(setup.child);
            assert!(
                entry.pagetable.is_none(),
                "process_fork_setup: thread {thread} already has a page table"
            );
            entry.pagetable = Some(PageTable::new(asid_of(thread)));
        }

        // The parent sleeps on the handshake, so its mappings hold still while we copy.
        let parent_thread = self
            .thread_get_thread_entry_by_pid(setup.parent)
            .expect("process_fork_setup: parent thread not found");
        let (parent_entries, parent_context) = {
            let entry = self.thread_table[parent_thread].lock(&self.platform);
            let pagetable = entry
                .pagetable
                .as_deref()
                .expect("process_fork_setup: parent has no page table");
            (pagetable.entries().to_vec(), entry.user_context)
        };

        if let Err(err) = self.copy_address_space(thread, &parent_entries) {
            warn!("process {}: fork copy failed: {err}", setup.child);
            let pagetable = {
                let mut entry = self.thread_table[thread].lock(&self.platform);
                entry.process_id = None;
                entry.pagetable.take()
            };
            if let Some(pagetable) = pagetable {
                self.vm_destroy_pagetable(pagetable);
            }
            setup.failed.store(true, Ordering::Release);
            self.platform.semaphore_v(&setup.handshake);
            self.platform.thread_finish();
        }

        let mut context = parent_context;
        context[MipsRegister::V0] = 0;
        context.pc = parent_context.pc.wrapping_add(4);

        self.platform.semaphore_v(&setup.handshake);
        self.platform.goto_userland(&context)
    }

    /// Give `thread` a private copy of every page mapped by `entries`
    fn copy_address_space(&self, thread: ThreadId, entries: &[TlbEntry]) -> Result<(), MapError> {
        for (vaddr, half) in entries.iter().flat_map(TlbEntry::pages) {
            let frame = self.map_fresh_page(thread, vaddr, half.dirty)?;
            self.copy_frame(frame, half.frame());
        }
        Ok(())
    }
}
