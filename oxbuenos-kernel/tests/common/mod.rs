#![allow(dead_code)]

use oxbuenos_kernel::context::{MipsRegister, UserContext};
use oxbuenos_kernel::platform::mock::{ElfImage, MockPlatform};
use oxbuenos_kernel::println::{self, StdoutPrint};
use oxbuenos_kernel::syscall::Syscall;
use oxbuenos_kernel::Kernel;
use std::thread;
use std::time::{Duration, Instant};

pub type TestKernel = Kernel<MockPlatform>;

/// Start of the text segment of every test program
pub const TEXT: u32 = 0x0040_0000;
/// Start of the data segment
pub const DATA: u32 = 0x0040_1000;
/// Size of the data segment in memory
pub const DATA_SIZE: u32 = 0x1010;
/// Where the heap of a test program starts
pub const HEAP_START: u32 = DATA + DATA_SIZE;
/// Frames a freshly loaded test program owns: text, two data pages, stack
pub const PROGRAM_FRAMES: usize = 4;
/// Scratch space on the user stack
pub const SCRATCH: u32 = 0x7fff_e100;

pub const TEXT_BYTES: &[u8] = b"\x27\xbd\xff\xe8text segment";
pub const DATA_BYTES: &[u8] = b"initialized data";

static CONSOLE: StdoutPrint = StdoutPrint;

/// A kernel on a fresh mock machine with `frames` frames, with the test
/// thread registered as a kernel thread
pub fn boot(frames: u32) -> &'static TestKernel {
    let _ = println::init(&CONSOLE);
    let kernel: &'static TestKernel = Box::leak(Box::new(Kernel::new(MockPlatform::new(frames))));
    kernel.platform().adopt_current_thread();
    kernel
}

/// Put an executable at `path` whose entry point is `entry`
pub fn install(kernel: &TestKernel, path: &str, entry: u32) {
    let image = ElfImage::new(entry)
        .ro(TEXT, TEXT_BYTES.to_vec())
        .rw(DATA, DATA_BYTES.to_vec(), DATA_SIZE)
        .build();
    kernel.platform().add_file(path, image);
}

/// Install `path` with `program` as its code
pub fn install_program(
    kernel: &TestKernel,
    path: &str,
    entry: u32,
    program: impl Fn(UserContext) + Send + Sync + 'static,
) {
    install(kernel, path, entry);
    kernel.platform().register_program(entry, program);
}

/// Trap into the kernel with system call `call`
pub fn syscall(
    kernel: &'static TestKernel,
    context: &mut UserContext,
    call: Syscall,
    args: [u32; 3],
) -> u32 {
    context[MipsRegister::A0] = call as u32;
    context[MipsRegister::A1] = args[0];
    context[MipsRegister::A2] = args[1];
    context[MipsRegister::A3] = args[2];
    kernel.syscall_handle(context);
    context[MipsRegister::V0]
}

/// Like [`syscall`], with the result read as signed
#[allow(clippy::cast_possible_wrap)]
pub fn syscall_signed(
    kernel: &'static TestKernel,
    context: &mut UserContext,
    call: Syscall,
    args: [u32; 3],
) -> i32 {
    syscall(kernel, context, call, args) as i32
}

#[allow(clippy::cast_sign_loss)]
pub fn exit(kernel: &'static TestKernel, context: &mut UserContext, code: i32) -> ! {
    syscall(kernel, context, Syscall::Exit, [code as u32, 0, 0]);
    unreachable!("exit returned")
}

/// Store `string` with its terminator at `vaddr` of the calling process
pub fn put_string(kernel: &TestKernel, vaddr: u32, string: &str) {
    let mut bytes = string.as_bytes().to_vec();
    bytes.push(0);
    kernel.copy_to_user(vaddr, &bytes).unwrap();
}

pub fn read_byte(kernel: &TestKernel, vaddr: u32) -> u8 {
    let mut byte = [0u8];
    kernel.copy_from_user(vaddr, &mut byte).unwrap();
    byte[0]
}

/// Poll `condition`, failing the test if a kernel thread panics or ten seconds pass
pub fn wait_until(kernel: &TestKernel, what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        let panics = kernel.platform().panics();
        assert!(panics.is_empty(), "kernel thread panicked: {panics:?}");
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}
