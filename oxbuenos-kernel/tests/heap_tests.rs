mod common;

use common::*;
use oxbuenos_kernel::param::USERLAND_END;
use oxbuenos_kernel::proc::HeapError;
use oxbuenos_kernel::syscall::Syscall;
use std::sync::{Arc, Mutex};

/// Run `body` as the code of a fresh process and return what it recorded
fn run_in_process<T: Send + 'static>(
    kernel: &'static TestKernel,
    body: impl Fn(&mut oxbuenos_kernel::context::UserContext) -> T + Send + Sync + 'static,
) -> T {
    let result = Arc::new(Mutex::new(None));
    let record = Arc::clone(&result);
    install_program(kernel, "[disk]heap", TEXT, move |mut context| {
        let value = body(&mut context);
        *record.lock().unwrap() = Some(value);
        exit(kernel, &mut context, 0)
    });
    let pid = kernel.process_spawn("[disk]heap").unwrap();
    assert_eq!(kernel.process_join(pid), Ok(0));
    let mut recorded = result.lock().unwrap();
    recorded.take().unwrap()
}

#[test]
fn zero_queries_the_heap_end() {
    let kernel = boot(32);
    let (query, again, free_before, free_after) = run_in_process(kernel, move |context| {
        let free_before = kernel.free_frames();
        let query = syscall(kernel, context, Syscall::Memlimit, [0, 0, 0]);
        let again = kernel.process_memlimit(0);
        (query, again, free_before, kernel.free_frames())
    });
    assert_eq!(query, HEAP_START);
    assert_eq!(again, Ok(HEAP_START));
    assert_eq!(free_before, free_after);
}

#[test]
fn growing_maps_each_new_page_once() {
    let kernel = boot(32);
    let (end, free_before, free_after, written) = run_in_process(kernel, move |context| {
        let free_before = kernel.free_frames();
        let end = syscall(kernel, context, Syscall::Memlimit, [0x0040_5000, 0, 0]);
        let free_after = kernel.free_frames();
        let written = kernel.copy_to_user(0x0040_5000, b"top of the heap").is_ok();
        (end, free_before, free_after, written)
    });
    assert_eq!(end, 0x0040_5000);
    assert_eq!(free_before - free_after, 3);
    assert!(written);
    assert_eq!(kernel.free_frames(), 32);
}

#[test]
fn growing_within_the_last_page_maps_nothing() {
    let kernel = boot(32);
    let (first, second, mapped) = run_in_process(kernel, move |_| {
        let first = kernel.process_memlimit(HEAP_START + 0x100);
        let free = kernel.free_frames();
        let second = kernel.process_memlimit(0x0040_2fff);
        (first, second, free - kernel.free_frames())
    });
    assert_eq!(first, Ok(HEAP_START + 0x100));
    assert_eq!(second, Ok(0x0040_2fff));
    assert_eq!(mapped, 0);
}

#[test]
fn shrinking_is_refused() {
    let kernel = boot(32);
    let (call, direct, after) = run_in_process(kernel, move |context| {
        let call = syscall(kernel, context, Syscall::Memlimit, [HEAP_START - 4, 0, 0]);
        let direct = kernel.process_memlimit(HEAP_START - 4);
        let after = kernel.process_memlimit(0);
        (call, direct, after)
    });
    assert_eq!(call, 0);
    assert_eq!(
        direct,
        Err(HeapError::Shrink {
            current: HEAP_START,
            requested: HEAP_START - 4,
        })
    );
    assert_eq!(after, Ok(HEAP_START));
}

#[test]
fn heap_stays_in_user_space() {
    let kernel = boot(32);
    let result = run_in_process(kernel, move |_| kernel.process_memlimit(USERLAND_END));
    assert_eq!(result, Err(HeapError::OutOfRange(USERLAND_END)));
}

#[test]
fn out_of_memory_keeps_the_old_end() {
    let kernel = boot(PROGRAM_FRAMES as u32 + 2);
    let (grow, end, free) = run_in_process(kernel, move |_| {
        let grow = kernel.process_memlimit(0x0040_5000);
        (grow, kernel.process_memlimit(0), kernel.free_frames())
    });
    assert_eq!(grow, Err(HeapError::OutOfMemory));
    assert_eq!(end, Ok(HEAP_START));
    // The pages mapped before running out stay with the process until it exits
    assert_eq!(free, 0);
    assert_eq!(kernel.free_frames(), PROGRAM_FRAMES + 2);
}
