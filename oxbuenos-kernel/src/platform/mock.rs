//! Host implementation of the platform traits, for running the process core
//! under `cargo test`.
//!
//! Kernel threads are host threads. Leaving for user mode runs the closure
//! registered for the entry program counter, which issues system calls and
//! memory accesses through the kernel the way a user program would trap into
//! it. Physical memory is an arena of pages and the filesystem lives in a map.

use super::{
    Interrupts, IntrStatus, OpenFile, PhysicalMemory, Semaphores, SleepQueue, ThreadFn, ThreadId,
    Threads, Tlb, TlbExceptionState, Vfs, VfsError, WaitKey,
};
use crate::context::UserContext;
use crate::param::{CONFIG_MAX_THREADS, PAGE_SIZE};
use crate::proc::asid_of;
use crate::vm::{PhysFrame, TlbEntry};
use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

const POLL: Duration = Duration::from_millis(50);

thread_local! {
    static CURRENT: Cell<Option<ThreadId>> = const { Cell::new(None) };
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Unwind payload of a kernel thread leaving through `thread_finish`
struct ThreadExit;

/// A user program: gets the context it was started with and must end with an exit system call
pub type Program = Arc<dyn Fn(UserContext) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Panics of kernel threads, shared with everything that can block
#[derive(Default, Clone)]
struct PanicLog(Arc<Mutex<Vec<String>>>);

impl PanicLog {
    fn record(&self, message: String) {
        lock(&self.0).push(message);
    }

    /// Bring a thread that waits on a dead kernel down with it
    fn check(&self) {
        let first = lock(&self.0).first().cloned();
        if let Some(message) = first {
            panic!("kernel thread panicked: {message}");
        }
    }
}

enum Slot {
    Free,
    Created(ThreadFn),
    Running,
}

struct PhysArena {
    pages: Box<[UnsafeCell<[u8; PAGE_SIZE]>]>,
}

// SAFETY: every frame is owned by one page table at a time, and the kernel
// never hands out two references to one frame
unsafe impl Sync for PhysArena {}

struct OpenState {
    name: String,
    position: usize,
}

#[derive(Default)]
struct MemVfs {
    files: HashMap<String, Vec<u8>>,
    open: HashMap<i32, OpenState>,
    next_handle: i32,
}

struct Inner {
    slots: Mutex<Vec<Slot>>,
    thread_limit: Mutex<usize>,
    asleep: Mutex<HashMap<ThreadId, WaitKey>>,
    wakeup: Condvar,
    panics: PanicLog,
    /// Threads blocked in `semaphore_p`
    blocked: Arc<AtomicUsize>,
    tlb_state: Mutex<TlbExceptionState>,
    tlb: Mutex<Vec<TlbEntry>>,
    arena: PhysArena,
    vfs: Mutex<MemVfs>,
    programs: Mutex<HashMap<u32, Program>>,
    entered: Mutex<Vec<UserContext>>,
}

/// Machine simulated on the host. Clones share the same machine.
#[derive(Clone)]
pub struct MockPlatform(Arc<Inner>);

impl MockPlatform {
    /// A machine with `frames` usable physical frames (numbered from 1)
    #[must_use]
    pub fn new(frames: u32) -> Self {
        let pages = (0..=frames)
            .map(|_| UnsafeCell::new([0u8; PAGE_SIZE]))
            .collect();
        Self(Arc::new(Inner {
            slots: Mutex::new((0..CONFIG_MAX_THREADS).map(|_| Slot::Free).collect()),
            thread_limit: Mutex::new(CONFIG_MAX_THREADS),
            asleep: Mutex::new(HashMap::new()),
            wakeup: Condvar::new(),
            panics: PanicLog::default(),
            blocked: Arc::new(AtomicUsize::new(0)),
            tlb_state: Mutex::new(TlbExceptionState::default()),
            tlb: Mutex::new(Vec::new()),
            arena: PhysArena { pages },
            vfs: Mutex::new(MemVfs {
                next_handle: 3,
                ..MemVfs::default()
            }),
            programs: Mutex::new(HashMap::new()),
            entered: Mutex::new(Vec::new()),
        }))
    }

    /// Allow only the first `limit` thread ids to be used
    pub fn set_thread_limit(&self, limit: usize) {
        *lock(&self.0.thread_limit) = limit.min(CONFIG_MAX_THREADS);
    }

    /// Register the calling host thread as a kernel thread
    pub fn adopt_current_thread(&self) -> ThreadId {
        let mut slots = lock(&self.0.slots);
        let id = slots
            .iter()
            .position(|slot| matches!(slot, Slot::Free))
            .expect("mock: thread table full");
        slots[id] = Slot::Running;
        CURRENT.with(|current| current.set(Some(id)));
        id
    }

    #[must_use]
    pub fn interrupts_enabled(&self) -> bool {
        INTERRUPTS_ENABLED.with(Cell::get)
    }

    /// Messages of kernel threads that panicked
    #[must_use]
    pub fn panics(&self) -> Vec<String> {
        lock(&self.0.panics.0).clone()
    }

    /// Number of threads blocked on any semaphore
    #[must_use]
    pub fn blocked_on_semaphores(&self) -> usize {
        self.0.blocked.load(Ordering::SeqCst)
    }

    /// Run `program` whenever a thread enters user mode at `pc`
    pub fn register_program(&self, pc: u32, program: impl Fn(UserContext) + Send + Sync + 'static) {
        lock(&self.0.programs).insert(pc, Arc::new(program));
    }

    /// Every context handed to `goto_userland`, in order
    #[must_use]
    pub fn entered_contexts(&self) -> Vec<UserContext> {
        lock(&self.0.entered).clone()
    }

    /// Latch the state the CPU would report for a TLB exception at `badvaddr`
    pub fn raise_tlb_exception(&self, badvaddr: u32) {
        let asid = asid_of(self.current_thread());
        *lock(&self.0.tlb_state) = TlbExceptionState::for_address(badvaddr, asid);
    }

    /// Entries written into the TLB so far
    #[must_use]
    pub fn tlb_entries(&self) -> Vec<TlbEntry> {
        lock(&self.0.tlb).clone()
    }

    pub fn add_file(&self, name: &str, contents: Vec<u8>) {
        lock(&self.0.vfs).files.insert(name.to_owned(), contents);
    }

    #[must_use]
    pub fn file_contents(&self, name: &str) -> Option<Vec<u8>> {
        lock(&self.0.vfs).files.get(name).cloned()
    }

    #[must_use]
    pub fn open_file_count(&self) -> usize {
        lock(&self.0.vfs).open.len()
    }

    fn free_slot(inner: &Inner, id: ThreadId) {
        lock(&inner.slots)[id] = Slot::Free;
        lock(&inner.asleep).remove(&id);
    }
}

impl Interrupts for MockPlatform {
    fn interrupt_disable(&self) -> IntrStatus {
        let was_enabled = INTERRUPTS_ENABLED.with(|enabled| enabled.replace(false));
        IntrStatus::from_raw(u32::from(was_enabled))
    }

    fn interrupt_set_state(&self, status: IntrStatus) {
        INTERRUPTS_ENABLED.with(|enabled| enabled.set(status.raw() != 0));
    }
}

impl Threads for MockPlatform {
    fn current_thread(&self) -> ThreadId {
        CURRENT
            .with(Cell::get)
            .expect("mock: host thread is not a kernel thread")
    }

    fn thread_create(&self, entry: ThreadFn) -> Option<ThreadId> {
        let limit = *lock(&self.0.thread_limit);
        let mut slots = lock(&self.0.slots);
        let id = slots[..limit]
            .iter()
            .position(|slot| matches!(slot, Slot::Free))?;
        slots[id] = Slot::Created(entry);
        Some(id)
    }

    fn thread_run(&self, id: ThreadId) {
        let entry = match std::mem::replace(&mut lock(&self.0.slots)[id], Slot::Running) {
            Slot::Created(entry) => entry,
            _ => panic!("mock: thread_run({id}) on a thread that was not created"),
        };
        let inner = Arc::clone(&self.0);
        thread::Builder::new()
            .name(format!("kthread-{id}"))
            .spawn(move || {
                CURRENT.with(|current| current.set(Some(id)));
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
                    if !payload.is::<ThreadExit>() {
                        inner.panics.record(panic_message(payload.as_ref()));
                    }
                }
                Self::free_slot(&inner, id);
            })
            .expect("mock: cannot spawn host thread");
    }

    fn thread_switch(&self) {
        let id = self.current_thread();
        let mut asleep = lock(&self.0.asleep);
        while asleep.contains_key(&id) {
            asleep = self
                .0
                .wakeup
                .wait_timeout(asleep, POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            if !lock(&self.0.panics.0).is_empty() {
                drop(asleep);
                self.0.panics.check();
                asleep = lock(&self.0.asleep);
            }
        }
        drop(asleep);
        thread::yield_now();
    }

    fn thread_finish(&self) -> ! {
        panic::resume_unwind(Box::new(ThreadExit))
    }

    fn goto_userland(&self, context: &UserContext) -> ! {
        lock(&self.0.entered).push(*context);
        let program = lock(&self.0.programs).get(&context.pc).cloned();
        let Some(program) = program else {
            panic!("mock: no user program at 0x{:08x}", context.pc);
        };
        program(*context);
        panic!("mock: user program at 0x{:08x} returned without exiting", context.pc);
    }
}

impl SleepQueue for MockPlatform {
    fn sleepq_add(&self, key: WaitKey) {
        let id = self.current_thread();
        lock(&self.0.asleep).insert(id, key);
    }

    fn sleepq_wake_all(&self, key: WaitKey) {
        lock(&self.0.asleep).retain(|_, waiting_on| *waiting_on != key);
        self.0.wakeup.notify_all();
    }
}

struct SemCounts {
    value: i32,
    /// Wakeups handed out by V and not yet taken by a blocked P
    permits: u32,
}

struct SemInner {
    counts: Mutex<SemCounts>,
    wakeup: Condvar,
    panics: PanicLog,
    blocked: Arc<AtomicUsize>,
}

#[derive(Clone)]
pub struct MockSemaphore(Arc<SemInner>);

impl Semaphores for MockPlatform {
    type Semaphore = MockSemaphore;

    fn semaphore_create(&self, value: i32) -> Option<MockSemaphore> {
        Some(MockSemaphore(Arc::new(SemInner {
            counts: Mutex::new(SemCounts { value, permits: 0 }),
            wakeup: Condvar::new(),
            panics: self.0.panics.clone(),
            blocked: Arc::clone(&self.0.blocked),
        })))
    }

    fn semaphore_p(&self, semaphore: &MockSemaphore) {
        let inner = &semaphore.0;
        let mut counts = lock(&inner.counts);
        counts.value -= 1;
        if counts.value >= 0 {
            return;
        }
        inner.blocked.fetch_add(1, Ordering::SeqCst);
        while counts.permits == 0 {
            counts = inner
                .wakeup
                .wait_timeout(counts, POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            if counts.permits == 0 && !lock(&inner.panics.0).is_empty() {
                drop(counts);
                inner.panics.check();
                counts = lock(&inner.counts);
            }
        }
        counts.permits -= 1;
        inner.blocked.fetch_sub(1, Ordering::SeqCst);
    }

    fn semaphore_v(&self, semaphore: &MockSemaphore) {
        let inner = &semaphore.0;
        let mut counts = lock(&inner.counts);
        counts.value += 1;
        if counts.value <= 0 {
            counts.permits += 1;
            inner.wakeup.notify_all();
        }
    }

    fn semaphore_value(&self, semaphore: &MockSemaphore) -> i32 {
        lock(&semaphore.0.counts).value
    }

    fn semaphore_destroy(&self, _semaphore: MockSemaphore) {}
}

impl Tlb for MockPlatform {
    fn tlb_exception_state(&self) -> TlbExceptionState {
        *lock(&self.0.tlb_state)
    }

    fn tlb_write_random(&self, entry: &TlbEntry) {
        lock(&self.0.tlb).push(*entry);
    }
}

impl PhysicalMemory for MockPlatform {
    #[allow(clippy::cast_possible_truncation)]
    fn usable_frames(&self) -> std::ops::Range<u32> {
        1..self.0.arena.pages.len() as u32
    }

    unsafe fn frame_mut(&self, frame: PhysFrame) -> &mut [u8; PAGE_SIZE] {
        let page = &self.0.arena.pages[frame.pfn() as usize];
        // SAFETY: the caller holds no other reference to this frame
        unsafe { &mut *page.get() }
    }
}

impl Vfs for MockPlatform {
    fn vfs_open(&self, path: &str) -> Result<OpenFile, VfsError> {
        let mut vfs = lock(&self.0.vfs);
        if !vfs.files.contains_key(path) {
            return Err(VfsError::NotFound);
        }
        let handle = vfs.next_handle;
        vfs.next_handle += 1;
        vfs.open.insert(
            handle,
            OpenState {
                name: path.to_owned(),
                position: 0,
            },
        );
        Ok(OpenFile(handle))
    }

    fn vfs_close(&self, file: OpenFile) -> Result<(), VfsError> {
        lock(&self.0.vfs)
            .open
            .remove(&file.0)
            .map(|_| ())
            .ok_or(VfsError::NotOpen)
    }

    fn vfs_seek(&self, file: OpenFile, position: u32) -> Result<(), VfsError> {
        let mut vfs = lock(&self.0.vfs);
        let MemVfs { files, open, .. } = &mut *vfs;
        let state = open.get_mut(&file.0).ok_or(VfsError::NotOpen)?;
        let size = files.get(&state.name).ok_or(VfsError::NotFound)?.len();
        if position as usize > size {
            return Err(VfsError::InvalidParams);
        }
        state.position = position as usize;
        Ok(())
    }

    fn vfs_read(&self, file: OpenFile, buffer: &mut [u8]) -> Result<usize, VfsError> {
        let mut vfs = lock(&self.0.vfs);
        let MemVfs { files, open, .. } = &mut *vfs;
        let state = open.get_mut(&file.0).ok_or(VfsError::NotOpen)?;
        let contents = files.get(&state.name).ok_or(VfsError::NotFound)?;
        let start = state.position.min(contents.len());
        let read = buffer.len().min(contents.len() - start);
        buffer[..read].copy_from_slice(&contents[start..start + read]);
        state.position = start + read;
        Ok(read)
    }

    fn vfs_write(&self, file: OpenFile, buffer: &[u8]) -> Result<usize, VfsError> {
        let mut vfs = lock(&self.0.vfs);
        let MemVfs { files, open, .. } = &mut *vfs;
        let state = open.get_mut(&file.0).ok_or(VfsError::NotOpen)?;
        let contents = files.get_mut(&state.name).ok_or(VfsError::NotFound)?;
        let end = state.position + buffer.len();
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[state.position..end].copy_from_slice(buffer);
        state.position = end;
        Ok(buffer.len())
    }
}

struct ImageSegment {
    vaddr: u32,
    data: Vec<u8>,
    mem_size: u32,
    writable: bool,
}

/// Builds minimal ELF32 MIPS executables
pub struct ElfImage {
    entry_point: u32,
    big_endian: bool,
    segments: Vec<ImageSegment>,
}

impl ElfImage {
    #[must_use]
    pub fn new(entry_point: u32) -> Self {
        Self {
            entry_point,
            big_endian: true,
            segments: Vec::new(),
        }
    }

    #[must_use]
    pub fn little_endian(mut self) -> Self {
        self.big_endian = false;
        self
    }

    /// Add a read-only, executable segment
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn ro(mut self, vaddr: u32, data: Vec<u8>) -> Self {
        let mem_size = data.len() as u32;
        self.segments.push(ImageSegment {
            vaddr,
            data,
            mem_size,
            writable: false,
        });
        self
    }

    /// Add a writable segment of `mem_size` bytes whose first bytes are `data`
    #[must_use]
    pub fn rw(mut self, vaddr: u32, data: Vec<u8>, mem_size: u32) -> Self {
        self.segments.push(ImageSegment {
            vaddr,
            data,
            mem_size,
            writable: true,
        });
        self
    }

    fn put_u16(&self, image: &mut Vec<u8>, value: u16) {
        if self.big_endian {
            image.extend_from_slice(&value.to_be_bytes());
        } else {
            image.extend_from_slice(&value.to_le_bytes());
        }
    }

    fn put_u32(&self, image: &mut Vec<u8>, value: u32) {
        if self.big_endian {
            image.extend_from_slice(&value.to_be_bytes());
        } else {
            image.extend_from_slice(&value.to_le_bytes());
        }
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(self) -> Vec<u8> {
        const EHDR_SIZE: u32 = 52;
        const PHDR_SIZE: u32 = 32;

        let mut image = vec![0x7f, b'E', b'L', b'F', 1, if self.big_endian { 2 } else { 1 }, 1];
        image.resize(16, 0);
        self.put_u16(&mut image, 2);
        self.put_u16(&mut image, 8);
        self.put_u32(&mut image, 1);
        self.put_u32(&mut image, self.entry_point);
        self.put_u32(&mut image, EHDR_SIZE);
        self.put_u32(&mut image, 0);
        self.put_u32(&mut image, 0);
        self.put_u16(&mut image, EHDR_SIZE as u16);
        self.put_u16(&mut image, PHDR_SIZE as u16);
        self.put_u16(&mut image, self.segments.len() as u16);
        self.put_u16(&mut image, 0);
        self.put_u16(&mut image, 0);
        self.put_u16(&mut image, 0);

        let mut location = EHDR_SIZE + PHDR_SIZE * self.segments.len() as u32;
        for segment in &self.segments {
            let flags = if segment.writable { 0b110 } else { 0b101 };
            self.put_u32(&mut image, 1);
            self.put_u32(&mut image, location);
            self.put_u32(&mut image, segment.vaddr);
            self.put_u32(&mut image, segment.vaddr);
            self.put_u32(&mut image, segment.data.len() as u32);
            self.put_u32(&mut image, segment.mem_size);
            self.put_u32(&mut image, flags);
            self.put_u32(&mut image, PAGE_SIZE as u32);
            location += segment.data.len() as u32;
        }
        for segment in &self.segments {
            image.extend_from_slice(&segment.data);
        }
        image
    }
}
