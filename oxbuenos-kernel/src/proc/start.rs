use super::{asid_of, ProcessError, ProcessId};
use crate::context::UserContext;
use crate::elf::{self, Segment};
use crate::name::FixedName;
use crate::param::{CONFIG_USERLAND_STACK_SIZE, PAGE_SIZE, USERLAND_STACK_TOP};
use crate::platform::{OpenFile, Platform, ThreadId};
use crate::vm::{PageTable, PAGE_SIZE_U32, PGROUNDDOWN};
use crate::Kernel;
use alloc::boxed::Box;
use alloc::vec;
use log::{info, warn};

impl<P: Platform> Kernel<P> {
    /// Start `executable` as a child of the calling process (or of no process,
    /// when called from a kernel thread). Returns the new pid.
    pub fn process_spawn(&'static self, executable: &str) -> Result<ProcessId, ProcessError> {
        let Some(pid) = self.alloc_process_id() else {
            warn!("process_spawn({executable}): process table full");
            return Err(ProcessError::PtableFull);
        };
        let parent = self.process_get_current_process();
        {
            let mut table = self.process_table.lock(&self.platform);
            table[pid].executable = FixedName::new(executable.as_bytes());
            table[pid].parent = parent;
        }

        let Some(thread) = self
            .platform
            .thread_create(Box::new(move || {
                self.process_start(pid);
            }))
        else {
            warn!("process_spawn({executable}): thread table full");
            self.release_process_id(pid);
            return Err(ProcessError::TtableFull);
        };
        info!("process {pid}: spawning {executable} on thread {thread}, parent {parent:?}");
        self.platform.thread_run(thread);
        Ok(pid)
    }

    /// Load the executable of `pid` into a new address space and enter it on the calling thread.
    /// Callers validate the executable first; any failure here panics.
    pub fn process_start(&self, pid: ProcessId) -> ! {
        let thread = self.platform.current_thread();
        let executable = self.process_table.lock(&self.platform)[pid].executable;

        {
            let mut entry = self.thread_table[thread].lock(&self.platform);
            entry.process_id = Some(pid);
            assert!(
                entry.pagetable.is_none(),
                "process_start: thread {thread} already has a page table"
            );
            entry.pagetable = Some(PageTable::new(asid_of(thread)));
        }

        let file = self
            .platform
            .vfs_open(executable.as_str())
            .unwrap_or_else(|err| panic!("process_start: open {executable:?}: {err}"));
        let elf = elf::parse(&self.platform, file)
            .unwrap_or_else(|err| panic!("process_start: {executable:?}: {err}"));
        assert!(
            elf.entry_point >= PAGE_SIZE_U32,
            "process_start: entry point 0x{:08x} in the first page",
            elf.entry_point
        );

        for page in 0..CONFIG_USERLAND_STACK_SIZE as u32 {
            let vaddr = PGROUNDDOWN!(USERLAND_STACK_TOP) - page * PAGE_SIZE_U32;
            self.map_fresh_page(thread, vaddr, true)
                .unwrap_or_else(|err| panic!("process_start: stack: {err}"));
        }
        for segment in [elf.ro, elf.rw] {
            for page in 0..segment.pages {
                self.map_fresh_page(thread, segment.vaddr + page * PAGE_SIZE_U32, true)
                    .unwrap_or_else(|err| panic!("process_start: segment: {err}"));
            }
        }

        let heap_end = if elf.rw.pages > 0 {
            elf.rw.end()
        } else {
            elf.ro.end()
        };
        self.process_table.lock(&self.platform)[pid].heap_end = heap_end;
        if heap_end % PAGE_SIZE_U32 == 0 {
            // The heap starts on a fresh page, which has to exist before the first memlimit
            self.map_fresh_page(thread, heap_end, true)
                .unwrap_or_else(|err| panic!("process_start: heap: {err}"));
        }

        self.load_segment(thread, file, &elf.ro);
        self.load_segment(thread, file, &elf.rw);
        for page in 0..elf.ro.pages {
            let vaddr = elf.ro.vaddr + page * PAGE_SIZE_U32;
            self.with_pagetable(thread, |pagetable| pagetable.set_dirty(vaddr, false))
                .and_then(Result::ok)
                .unwrap_or_else(|| panic!("process_start: read-only page 0x{vaddr:08x} vanished"));
        }
        if let Err(err) = self.platform.vfs_close(file) {
            warn!("process_start: closing {executable:?}: {err}");
        }

        info!(
            "process {pid}: entering {executable:?} at 0x{:08x}, heap at 0x{heap_end:08x}",
            elf.entry_point
        );
        let context = UserContext::new(elf.entry_point, USERLAND_STACK_TOP);
        self.platform.goto_userland(&context)
    }

    fn load_segment(&self, thread: ThreadId, file: OpenFile, segment: &Segment) {
        if segment.file_size == 0 {
            return;
        }
        self.platform
            .vfs_seek(file, segment.location)
            .unwrap_or_else(|err| panic!("process_start: seek: {err}"));

        let mut buffer = vec![0u8; PAGE_SIZE];
        let mut done = 0;
        while done < segment.file_size {
            let want = core::cmp::min(PAGE_SIZE as u32, segment.file_size - done) as usize;
            let read = self
                .platform
                .vfs_read(file, &mut buffer[..want])
                .unwrap_or_else(|err| panic!("process_start: read: {err}"));
            assert!(read > 0, "process_start: executable truncated");
            self.write_user_unchecked(thread, segment.vaddr + done, &buffer[..read])
                .unwrap_or_else(|err| panic!("process_start: copy: {err}"));
            done += read as u32;
        }
    }
}
