use super::{Pcb, ProcessError, ProcessId, ProcessState};
use crate::param::PROCESS_MAX_PROCESSES;
use crate::platform::{Platform, WaitKey};
use crate::sync::InterruptGuard;
use crate::Kernel;
use log::{info, warn};

impl<P: Platform> Kernel<P> {
    /// Terminate the calling process with `retval` and retire its thread.
    /// The process stays a zombie until its parent joins it.
    pub fn process_finish(&self, retval: i32) -> ! {
        let thread = self.platform.current_thread();
        let pid = self.current_process();

        {
            let masked = InterruptGuard::new(&self.platform);
            let mut table = self.process_table.lock_masked(&masked);
            table[pid].retval = retval;
            table[pid].state = ProcessState::Zombie;

            let pagetable = {
                let mut entry = self.thread_table[thread].lock_masked(&masked);
                core::mem::take(&mut *entry).pagetable
            };
            if let Some(pagetable) = pagetable {
                self.vm_destroy_pagetable(pagetable);
            }

            self.platform.sleepq_wake_all(WaitKey::Process(pid));

            // Orphans keep running without a parent to join them
            for pcb in table.iter_mut().filter(|pcb| pcb.parent == Some(pid)) {
                pcb.parent = None;
            }
        }

        info!("process {pid}: finished with {retval}");
        self.platform.thread_finish()
    }

    /// Wait for child `pid` to finish and return its exit value. The last
    /// joiner to leave frees the child's slot.
    pub fn process_join(&self, pid: ProcessId) -> Result<i32, ProcessError> {
        let caller = self.process_get_current_process();

        let masked = InterruptGuard::new(&self.platform);
        let mut table = self.process_table.lock_masked(&masked);
        if pid >= PROCESS_MAX_PROCESSES
            || table[pid].state == ProcessState::Free
            || table[pid].parent != caller
        {
            warn!("process {caller:?}: illegal join of {pid}");
            return Err(ProcessError::IllegalJoin);
        }

        table[pid].joiners += 1;
        while table[pid].state != ProcessState::Zombie {
            self.platform.sleepq_add(WaitKey::Process(pid));
            drop(table);
            self.platform.thread_switch();
            table = self.process_table.lock_masked(&masked);
        }

        let retval = table[pid].retval;
        table[pid].joiners -= 1;
        if table[pid].joiners == 0 {
            table[pid] = Pcb::FREE;
        }
        Ok(retval)
    }
}
