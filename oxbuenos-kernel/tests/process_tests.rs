mod common;

use common::*;
use oxbuenos_kernel::context::MipsRegister;
use oxbuenos_kernel::param::{PROCESS_MAX_PROCESSES, USERLAND_STACK_TOP};
use oxbuenos_kernel::platform::Threads;
use oxbuenos_kernel::proc::{ProcessError, ProcessState};
use oxbuenos_kernel::syscall::Syscall;
use std::sync::{Arc, Mutex};

#[test]
fn spawn_then_join_returns_exit_value() {
    let kernel = boot(32);
    install_program(kernel, "[disk]seven", TEXT, move |mut context| {
        exit(kernel, &mut context, 7)
    });

    let pid = kernel.process_spawn("[disk]seven").unwrap();
    assert_eq!(kernel.process_entry(pid).unwrap().executable(), "[disk]seven");
    assert_eq!(kernel.process_join(pid), Ok(7));

    assert_eq!(kernel.process_entry(pid).unwrap().state(), ProcessState::Free);
    assert_eq!(kernel.process_join(pid), Err(ProcessError::IllegalJoin));
    assert_eq!(kernel.free_frames(), 32);
}

#[test]
fn loader_builds_the_address_space() {
    let kernel = boot(32);
    let seen = Arc::new(Mutex::new(None));
    let record = Arc::clone(&seen);
    install_program(kernel, "[disk]inspect", TEXT + 4, move |mut context| {
        let pagetable = kernel.current_pagetable().unwrap();
        let mut text = vec![0u8; TEXT_BYTES.len()];
        kernel.copy_from_user(TEXT, &mut text).unwrap();
        let mut data = vec![0u8; DATA_BYTES.len()];
        kernel.copy_from_user(DATA, &mut data).unwrap();
        let bss_is_zero = read_byte(kernel, HEAP_START - 1) == 0;
        let text_write = kernel.copy_to_user(TEXT, b"x");
        *record.lock().unwrap() = Some((context, pagetable, text, data, bss_is_zero, text_write));
        exit(kernel, &mut context, 0)
    });

    let pid = kernel.process_spawn("[disk]inspect").unwrap();
    assert_eq!(kernel.process_join(pid), Ok(0));

    let (context, pagetable, text, data, bss_is_zero, text_write) =
        seen.lock().unwrap().take().unwrap();
    assert_eq!(context.pc, TEXT + 4);
    assert_eq!(context[MipsRegister::Sp], USERLAND_STACK_TOP);
    assert_eq!(context[MipsRegister::V0], 0);
    assert_eq!(text, TEXT_BYTES);
    assert_eq!(data, DATA_BYTES);
    assert!(bss_is_zero);
    assert!(text_write.is_err());

    assert_eq!(pagetable.frames().count(), PROGRAM_FRAMES);
    assert!(!pagetable.translate(TEXT).unwrap().dirty);
    assert!(pagetable.translate(DATA).unwrap().dirty);
    assert!(pagetable.translate(USERLAND_STACK_TOP).unwrap().dirty);
}

#[test]
fn page_aligned_heap_gets_its_first_page() {
    let kernel = boot(32);
    let image = oxbuenos_kernel::platform::mock::ElfImage::new(TEXT)
        .ro(TEXT, TEXT_BYTES.to_vec())
        .rw(DATA, DATA_BYTES.to_vec(), 0x1000)
        .build();
    kernel.platform().add_file("[disk]aligned", image);
    let heap = Arc::new(Mutex::new(None));
    let record = Arc::clone(&heap);
    kernel.platform().register_program(TEXT, move |mut context| {
        let end = syscall(kernel, &mut context, Syscall::Memlimit, [0, 0, 0]);
        let mapped = kernel.current_pagetable().unwrap().translate(end);
        *record.lock().unwrap() = Some((end, mapped));
        exit(kernel, &mut context, 0)
    });

    let pid = kernel.process_spawn("[disk]aligned").unwrap();
    assert_eq!(kernel.process_join(pid), Ok(0));
    let (end, mapped) = heap.lock().unwrap().take().unwrap();
    assert_eq!(end, DATA + 0x1000);
    assert!(mapped.unwrap().dirty);
}

#[test]
#[should_panic(expected = "no such file")]
fn loading_a_missing_executable_is_fatal() {
    let kernel = boot(8);
    let pid = kernel.process_spawn("[disk]missing").unwrap();
    let _ = kernel.process_join(pid);
}

#[test]
fn illegal_joins_do_not_block() {
    let kernel = boot(32);
    assert_eq!(
        kernel.process_join(PROCESS_MAX_PROCESSES),
        Err(ProcessError::IllegalJoin)
    );
    assert_eq!(kernel.process_join(3), Err(ProcessError::IllegalJoin));

    let gate = kernel.usr_sem_open("gate", 0).unwrap();
    install_program(kernel, "[disk]grandchild", TEXT + 0x100, move |mut context| {
        kernel.usr_sem_p(gate).unwrap();
        exit(kernel, &mut context, 5)
    });
    install_program(kernel, "[disk]child", TEXT, move |mut context| {
        put_string(kernel, SCRATCH, "[disk]grandchild");
        let grandchild = syscall(kernel, &mut context, Syscall::Exec, [SCRATCH, 0, 0]);
        let retval = syscall(kernel, &mut context, Syscall::Join, [grandchild, 0, 0]);
        exit(kernel, &mut context, retval as i32 + 100)
    });

    let child = kernel.process_spawn("[disk]child").unwrap();
    let mut grandchild = None;
    wait_until(kernel, "grandchild", || {
        grandchild = (0..PROCESS_MAX_PROCESSES).find(|&pid| {
            kernel
                .process_entry(pid)
                .is_some_and(|pcb| pcb.parent() == Some(child))
        });
        grandchild.is_some()
    });
    let grandchild = grandchild.unwrap();

    // Only the parent may join
    assert_eq!(
        kernel.process_join(grandchild),
        Err(ProcessError::IllegalJoin)
    );
    kernel.usr_sem_v(gate).unwrap();
    assert_eq!(kernel.process_join(child), Ok(105));
}

#[test]
fn process_table_fills_up() {
    let kernel = boot(PROCESS_MAX_PROCESSES as u32 * PROGRAM_FRAMES as u32);
    let gate = kernel.usr_sem_open("hold", 0).unwrap();
    install_program(kernel, "[disk]wait", TEXT, move |mut context| {
        kernel.usr_sem_p(gate).unwrap();
        exit(kernel, &mut context, 1)
    });

    let pids: Vec<_> = (0..PROCESS_MAX_PROCESSES)
        .map(|_| kernel.process_spawn("[disk]wait").unwrap())
        .collect();
    assert_eq!(
        kernel.process_spawn("[disk]wait"),
        Err(ProcessError::PtableFull)
    );

    for _ in &pids {
        kernel.usr_sem_v(gate).unwrap();
    }
    for pid in pids {
        assert_eq!(kernel.process_join(pid), Ok(1));
    }
    assert_eq!(kernel.free_frames(), PROCESS_MAX_PROCESSES * PROGRAM_FRAMES);
}

#[test]
fn thread_table_full_releases_the_pid() {
    let kernel = boot(16);
    install_program(kernel, "[disk]ok", TEXT, move |mut context| {
        exit(kernel, &mut context, 3)
    });

    kernel.platform().set_thread_limit(1);
    assert_eq!(
        kernel.process_spawn("[disk]ok"),
        Err(ProcessError::TtableFull)
    );
    assert_eq!(kernel.process_entry(0).unwrap().state(), ProcessState::Free);

    kernel.platform().set_thread_limit(usize::MAX);
    let pid = kernel.process_spawn("[disk]ok").unwrap();
    assert_eq!(pid, 0);
    assert_eq!(kernel.process_join(pid), Ok(3));
}

#[test]
fn every_joiner_gets_the_exit_value() {
    let kernel = boot(16);
    let gate = kernel.usr_sem_open("finish", 0).unwrap();
    install_program(kernel, "[disk]slow", TEXT, move |mut context| {
        kernel.usr_sem_p(gate).unwrap();
        exit(kernel, &mut context, 42)
    });
    let pid = kernel.process_spawn("[disk]slow").unwrap();

    let results = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..3 {
        let results = Arc::clone(&results);
        let thread = kernel
            .platform()
            .thread_create(Box::new(move || {
                let retval = kernel.process_join(pid);
                results.lock().unwrap().push(retval);
            }))
            .unwrap();
        kernel.platform().thread_run(thread);
    }
    wait_until(kernel, "three joiners", || {
        kernel.process_entry(pid).unwrap().joiners() == 3
    });
    assert_eq!(kernel.process_entry(pid).unwrap().state(), ProcessState::Running);

    kernel.usr_sem_v(gate).unwrap();
    wait_until(kernel, "joiners to return", || results.lock().unwrap().len() == 3);
    assert_eq!(*results.lock().unwrap(), vec![Ok(42); 3]);
    assert_eq!(kernel.process_entry(pid).unwrap().state(), ProcessState::Free);
    assert_eq!(kernel.process_join(pid), Err(ProcessError::IllegalJoin));
}

#[test]
fn orphans_lose_their_parent() {
    let kernel = boot(32);
    let gate = kernel.usr_sem_open("orphan", 0).unwrap();
    install_program(kernel, "[disk]orphan", TEXT + 0x100, move |mut context| {
        kernel.usr_sem_p(gate).unwrap();
        exit(kernel, &mut context, 9)
    });
    install_program(kernel, "[disk]parent", TEXT, move |mut context| {
        put_string(kernel, SCRATCH, "[disk]orphan");
        let orphan = syscall(kernel, &mut context, Syscall::Exec, [SCRATCH, 0, 0]);
        exit(kernel, &mut context, orphan as i32)
    });

    let parent = kernel.process_spawn("[disk]parent").unwrap();
    let orphan = usize::try_from(kernel.process_join(parent).unwrap()).unwrap();
    assert_eq!(kernel.process_entry(orphan).unwrap().parent(), None);
    assert_eq!(kernel.process_entry(orphan).unwrap().state(), ProcessState::Running);

    // With no parent left, a kernel thread may collect it
    kernel.usr_sem_v(gate).unwrap();
    assert_eq!(kernel.process_join(orphan), Ok(9));
}
