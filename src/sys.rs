/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
 */

//! System call wrappers.

use std::io::{Error, ErrorKind};
use std::os::unix::io::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::{c_int, pid_t};

/// Forks the current process.  Returns `Ok(Some(pid))` in the parent,
/// `Ok(None)` in the child.
///
/// # Safety
///
/// Any threads other than the calling one are dead in the child, so this must
/// only be called while the process is single-threaded.
pub unsafe fn fork() -> Result<Option<pid_t>, Error> {
    let pid = libc::fork();
    if pid < 0 {
        Err(Error::last_os_error())
    } else if pid == 0 {
        Ok(None)
    } else {
        Ok(Some(pid))
    }
}

/// Blocks until the child identified by `pid` exits, retrying on `EINTR`.
pub fn waitpid(pid: pid_t) -> Result<(pid_t, ExitStatus), Error> {
    loop {
        let mut status = 0;
        let retval = unsafe { libc::waitpid(pid, &mut status as *mut c_int, 0) };
        if retval != -1 {
            return Ok((retval, ExitStatus::from_raw(status)));
        }
        let err = Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Polls the child identified by `pid` without blocking.  Returns `Ok(None)`
/// while the child is still running.
pub fn waitpid_nohang(pid: pid_t) -> Result<Option<ExitStatus>, Error> {
    loop {
        let mut status = 0;
        let retval = unsafe { libc::waitpid(pid, &mut status as *mut c_int, libc::WNOHANG) };
        match retval {
            -1 => {
                let err = Error::last_os_error();
                if err.kind() != ErrorKind::Interrupted {
                    return Err(err);
                }
            }
            0 => return Ok(None),
            _ => return Ok(Some(ExitStatus::from_raw(status))),
        }
    }
}

/// Collapses an [`ExitStatus`] into the single integer the restart policy
/// acts on: the exit code for a normal exit, `128 + signal` for a signal
/// death.
pub fn exit_code(status: &ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

pub fn dup2(src: RawFd, dst: RawFd) -> Result<(), Error> {
    if unsafe { libc::dup2(src, dst) } < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

pub fn setsid() -> Result<pid_t, Error> {
    match unsafe { libc::setsid() } {
        -1 => Err(Error::last_os_error()),
        pid => Ok(pid),
    }
}

pub fn umask(mask: libc::mode_t) -> libc::mode_t {
    unsafe { libc::umask(mask) }
}

pub fn getpid() -> pid_t {
    unsafe { libc::getpid() }
}

pub fn getppid() -> pid_t {
    unsafe { libc::getppid() }
}

/// A boolean flag in a shared anonymous mapping, visible to every process
/// forked after its creation.  The single page backing it is never unmapped;
/// the flag lives as long as the pool that created it.
#[derive(Clone, Copy)]
pub struct SharedFlag {
    cell: *const AtomicBool,
}

// The cell lives in a MAP_SHARED mapping and is only accessed atomically.
unsafe impl Send for SharedFlag {}
unsafe impl Sync for SharedFlag {}

impl SharedFlag {
    pub fn new() -> Result<SharedFlag, Error> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                std::mem::size_of::<AtomicBool>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        let cell = ptr as *mut AtomicBool;
        unsafe { cell.write(AtomicBool::new(false)) };
        Ok(SharedFlag { cell })
    }

    pub fn set(&self) {
        unsafe { &*self.cell }.store(true, Ordering::SeqCst);
    }

    pub fn get(&self) -> bool {
        unsafe { &*self.cell }.load(Ordering::SeqCst)
    }

    pub(crate) fn as_ptr(&self) -> *const AtomicBool {
        self.cell
    }
}

#[cfg(target_os = "linux")]
fn count_threads(pid: u32) -> Result<usize, Error> {
    Ok(std::fs::read_dir(format!("/proc/{pid}/task"))?.count())
}

#[cfg(target_os = "linux")]
pub fn assert_single_threaded() {
    assert_eq!(count_threads(std::process::id()).unwrap(), 1);
}

#[cfg(not(target_os = "linux"))]
pub fn assert_single_threaded() {
    // Don't know how to count our threads.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_flag_starts_clear_and_latches() {
        let flag = SharedFlag::new().unwrap();
        assert!(!flag.get());
        flag.set();
        assert!(flag.get());
        let copy = flag;
        assert!(copy.get());
    }

    #[test]
    fn exit_code_maps_signals_past_127() {
        let exited = ExitStatus::from_raw(0x0100); // exit(1)
        assert_eq!(exit_code(&exited), 1);
        let killed = ExitStatus::from_raw(libc::SIGKILL); // died on SIGKILL
        assert_eq!(exit_code(&killed), 128 + libc::SIGKILL);
    }
}
