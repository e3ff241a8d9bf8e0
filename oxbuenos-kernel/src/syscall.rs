//! System call entry.
//!
//! A user program puts the call number in a0 and up to three arguments in
//! a1..a3, then traps. The result goes back in v0 and execution resumes at
//! the instruction after the trap.

use crate::context::{MipsRegister, UserContext};
use crate::param::{FAULT_EXIT_CODE, PAGE_SIZE, PROCESS_MAX_FILELENGTH};
use crate::platform::{OpenFile, Platform, VfsError};
use crate::proc::ProcessError;
use crate::usr_sem::{UsrSemError, UsrSemHandle};
use crate::vm::UserMemoryError;
use crate::Kernel;
use alloc::string::String;
use alloc::vec;
use log::{debug, error, warn};
use num_enum::TryFromPrimitive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum Syscall {
    Exec = 0x101,
    Exit = 0x102,
    Join = 0x103,
    Fork = 0x104,
    Memlimit = 0x105,
    GetPid = 0x106,
    Open = 0x201,
    Close = 0x202,
    Seek = 0x203,
    Read = 0x204,
    Write = 0x205,
    SemOpen = 0x300,
    SemP = 0x301,
    SemV = 0x302,
    SemDestroy = 0x303,
}

/// A negative result as the register value user programs see
#[allow(clippy::cast_sign_loss)]
fn from_signed(value: i32) -> u32 {
    value as u32
}

#[allow(clippy::cast_possible_wrap)]
fn to_signed(value: u32) -> i32 {
    value as i32
}

#[allow(clippy::cast_possible_truncation)]
fn pid_result(pid: usize) -> u32 {
    pid as u32
}

impl<P: Platform> Kernel<P> {
    /// Serve the system call described by `context` and advance it past the trap
    pub fn syscall_handle(&'static self, context: &mut UserContext) {
        let thread = self.platform.current_thread();
        self.thread_table[thread].lock(&self.platform).user_context = *context;

        let number = context[MipsRegister::A0];
        let args = [
            context[MipsRegister::A1],
            context[MipsRegister::A2],
            context[MipsRegister::A3],
        ];
        let Ok(call) = Syscall::try_from(number) else {
            error!("thread {thread}: unknown system call 0x{number:x}");
            self.process_finish(FAULT_EXIT_CODE);
        };
        debug!("thread {thread}: {call:?}({:#x}, {:#x}, {:#x})", args[0], args[1], args[2]);

        let result = match self.syscall_dispatch(call, args) {
            Ok(value) => value,
            Err(err) => {
                error!("thread {thread}: {call:?}: {err}");
                self.process_finish(FAULT_EXIT_CODE)
            }
        };
        context[MipsRegister::V0] = result;
        context.pc = context.pc.wrapping_add(4);
    }

    /// Run one call. A bad user pointer is an error, everything else is a result.
    fn syscall_dispatch(&'static self, call: Syscall, args: [u32; 3]) -> Result<u32, UserMemoryError> {
        let [a1, a2, a3] = args;
        let result = match call {
            Syscall::Exec => {
                let path = self.user_path(a1)?;
                match self.process_spawn(&path) {
                    Ok(pid) => pid_result(pid),
                    Err(err) => from_signed(err.into()),
                }
            }
            Syscall::Exit => self.process_finish(to_signed(a1)),
            Syscall::Join => {
                let joined = usize::try_from(a1)
                    .map_err(|_| ProcessError::IllegalJoin)
                    .and_then(|pid| self.process_join(pid));
                match joined {
                    Ok(retval) => from_signed(retval),
                    Err(err) => from_signed(err.into()),
                }
            }
            Syscall::Fork => match self.process_fork() {
                Ok(pid) => pid_result(pid),
                Err(err) => from_signed(err.into()),
            },
            Syscall::Memlimit => self.process_memlimit(a1).unwrap_or(0),
            Syscall::GetPid => self
                .process_get_current_process()
                .map_or(from_signed(-1), pid_result),
            Syscall::Open => {
                let path = self.user_path(a1)?;
                match self.platform.vfs_open(&path) {
                    Ok(file) if self.process_add_file(file) => from_signed(file.0),
                    Ok(file) => {
                        if let Err(err) = self.platform.vfs_close(file) {
                            warn!("open {path}: closing refused file: {err}");
                        }
                        from_signed(ProcessError::FileTableFull.into())
                    }
                    Err(err) => from_signed(err.into()),
                }
            }
            Syscall::Close => {
                let file = OpenFile(to_signed(a1));
                if self.process_remove_file(file) {
                    self.platform
                        .vfs_close(file)
                        .map_or_else(|err| from_signed(err.into()), |()| 0)
                } else {
                    from_signed(VfsError::NotOpen.into())
                }
            }
            Syscall::Seek => {
                let file = OpenFile(to_signed(a1));
                if self.process_has_open_file(file) {
                    self.platform
                        .vfs_seek(file, a2)
                        .map_or_else(|err| from_signed(err.into()), |()| 0)
                } else {
                    from_signed(VfsError::NotOpen.into())
                }
            }
            Syscall::Read => self.syscall_read(OpenFile(to_signed(a1)), a2, a3)?,
            Syscall::Write => self.syscall_write(OpenFile(to_signed(a1)), a2, a3)?,
            Syscall::SemOpen => {
                let name = self.copy_string_from_user(a1, PAGE_SIZE)?;
                self.usr_sem_open(&name, to_signed(a2))
                    .map_or(0, UsrSemHandle::into_raw)
            }
            Syscall::SemP => Self::sem_result(
                UsrSemHandle::from_raw(a1)
                    .ok_or(UsrSemError::NotInUse)
                    .and_then(|handle| self.usr_sem_p(handle)),
            ),
            Syscall::SemV => Self::sem_result(
                UsrSemHandle::from_raw(a1)
                    .ok_or(UsrSemError::NotInUse)
                    .and_then(|handle| self.usr_sem_v(handle)),
            ),
            Syscall::SemDestroy => {
                let destroyed = UsrSemHandle::from_raw(a1)
                    .ok_or(UsrSemError::NotInUse)
                    .and_then(|handle| self.usr_sem_destroy(handle));
                u32::from(destroyed.is_ok())
            }
        };
        Ok(result)
    }

    fn sem_result(result: Result<(), UsrSemError>) -> u32 {
        match result {
            Ok(()) => 0,
            Err(_) => from_signed(UsrSemError::NotInUse.into()),
        }
    }

    fn user_path(&self, vaddr: u32) -> Result<String, UserMemoryError> {
        let bytes = self.copy_string_from_user(vaddr, PROCESS_MAX_FILELENGTH - 1)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn syscall_read(&self, file: OpenFile, buffer: u32, length: u32) -> Result<u32, UserMemoryError> {
        if !self.process_has_open_file(file) {
            return Ok(from_signed(VfsError::NotOpen.into()));
        }
        let mut bounce = vec![0u8; PAGE_SIZE];
        let mut done = 0u32;
        while done < length {
            let want = core::cmp::min(PAGE_SIZE as u32, length - done) as usize;
            let read = match self.platform.vfs_read(file, &mut bounce[..want]) {
                Ok(read) => read,
                Err(err) if done == 0 => return Ok(from_signed(err.into())),
                Err(_) => break,
            };
            self.copy_to_user(buffer.wrapping_add(done), &bounce[..read])?;
            done += read as u32;
            if read < want {
                break;
            }
        }
        Ok(done)
    }

    fn syscall_write(&self, file: OpenFile, buffer: u32, length: u32) -> Result<u32, UserMemoryError> {
        if !self.process_has_open_file(file) {
            return Ok(from_signed(VfsError::NotOpen.into()));
        }
        let mut bounce = vec![0u8; PAGE_SIZE];
        let mut done = 0u32;
        while done < length {
            let chunk = core::cmp::min(PAGE_SIZE as u32, length - done) as usize;
            self.copy_from_user(buffer.wrapping_add(done), &mut bounce[..chunk])?;
            let written = match self.platform.vfs_write(file, &bounce[..chunk]) {
                Ok(written) => written,
                Err(err) if done == 0 => return Ok(from_signed(err.into())),
                Err(_) => break,
            };
            done += written as u32;
            if written < chunk {
                break;
            }
        }
        Ok(done)
    }
}
