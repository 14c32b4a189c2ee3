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

//! Per-process role state, the SIGTERM handler, and cooperative sleeping.
//!
//! Each process in the supervision tree tags itself with a role at entry.
//! The shared SIGTERM handler dispatches on that tag and does nothing beyond
//! flipping flags and sending at most one `kill(2)` per direction:
//!
//!   - the guardian forwards SIGTERM to the executor once, so the executor
//!     gets a chance to stop user code;
//!   - the executor raises the pool-wide quit flag and SIGTERMs the guardian
//!     once, so the guardian does not relaunch it;
//!   - a worker only raises its local quit flag — pool-wide shutdown travels
//!     exclusively through the shared flag, so a worker signalled on its own
//!     does not take its siblings with it.
//!
//! The "have I already signalled the other side" bits keep a re-delivered
//! SIGTERM from turning the mutual-kill handshake into a storm.
//!
//! Forked children inherit the handler registration and merely re-tag their
//! role; the handler itself is installed once per process image.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU8, Ordering};
use std::sync::Once;
use std::time::{Duration, Instant};

use libc::pid_t;
use signal_hook::consts::signal::SIGTERM;
use tracing::{event, Level};

use crate::sys::SharedFlag;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum Role {
    Guardian = 1,
    Executor = 2,
    Worker = 3,
}

static ROLE: AtomicU8 = AtomicU8::new(0);
static QUIT_REQUESTED: AtomicBool = AtomicBool::new(false);
static GUARDIAN_PID: AtomicI32 = AtomicI32::new(0);
static EXECUTOR_PID: AtomicI32 = AtomicI32::new(0);
static GUARDIAN_KILLED: AtomicBool = AtomicBool::new(false);
static EXECUTOR_KILLED: AtomicBool = AtomicBool::new(false);
static POOL_QUIT: AtomicPtr<AtomicBool> = AtomicPtr::new(ptr::null_mut());
static INSTALL: Once = Once::new();

/// The longest a cooperative sleep stays blocked without re-checking the
/// quit flag.
pub const SLEEP_STEP: Duration = Duration::from_secs(1);

pub(crate) fn enter_guardian() {
    ROLE.store(Role::Guardian as u8, Ordering::SeqCst);
    install_sigterm_handler();
}

pub(crate) fn enter_executor(guardian_pid: pid_t, executor_pid: pid_t) {
    ROLE.store(Role::Executor as u8, Ordering::SeqCst);
    GUARDIAN_PID.store(guardian_pid, Ordering::SeqCst);
    EXECUTOR_PID.store(executor_pid, Ordering::SeqCst);
    GUARDIAN_KILLED.store(false, Ordering::SeqCst);
    install_sigterm_handler();
}

pub(crate) fn enter_worker(pool_quit: &SharedFlag) {
    ROLE.store(Role::Worker as u8, Ordering::SeqCst);
    POOL_QUIT.store(pool_quit.as_ptr() as *mut AtomicBool, Ordering::SeqCst);
    install_sigterm_handler();
}

/// Records the executor the guardian is currently waiting on, re-arming the
/// kill-once guard for the new child.
pub(crate) fn set_executor_pid(pid: pid_t) {
    EXECUTOR_PID.store(pid, Ordering::SeqCst);
    EXECUTOR_KILLED.store(false, Ordering::SeqCst);
}

pub(crate) fn clear_executor_pid() {
    EXECUTOR_PID.store(0, Ordering::SeqCst);
}

/// Makes the pool-wide quit flag visible to this process's SIGTERM handler.
pub(crate) fn set_pool_quit(pool_quit: &SharedFlag) {
    POOL_QUIT.store(pool_quit.as_ptr() as *mut AtomicBool, Ordering::SeqCst);
}

/// Whether this process has been asked to shut down.  Workers also observe
/// the pool-wide flag here, since they cannot see their parent's memory.
pub fn quit_requested() -> bool {
    if QUIT_REQUESTED.load(Ordering::SeqCst) {
        return true;
    }
    if ROLE.load(Ordering::SeqCst) == Role::Worker as u8 {
        let flag = POOL_QUIT.load(Ordering::SeqCst);
        if !flag.is_null() {
            return unsafe { &*flag }.load(Ordering::SeqCst);
        }
    }
    false
}

/// Whether this process itself received SIGTERM, ignoring the pool flag.
pub(crate) fn local_quit_requested() -> bool {
    QUIT_REQUESTED.load(Ordering::SeqCst)
}

/// Sleeps for `duration`, returning early once [`quit_requested`] turns
/// true.  The only sanctioned way for supervision code to block on time.
pub fn sleep(duration: Duration) {
    sleep_while(duration, || !quit_requested());
}

/// Sleeps for `duration` in steps of at most [`SLEEP_STEP`], returning as
/// soon as `keep_waiting` turns false.  The final step is truncated to the
/// remaining time.
pub fn sleep_while<F>(duration: Duration, keep_waiting: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + duration;
    loop {
        if !keep_waiting() {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep(SLEEP_STEP.min(deadline - now));
    }
}

fn install_sigterm_handler() {
    INSTALL.call_once(|| {
        // SAFETY: the handler only touches atomics and calls kill(2), all of
        // which are async-signal-safe.
        if let Err(error) = unsafe { signal_hook::low_level::register(SIGTERM, on_sigterm) } {
            event!(Level::ERROR, "could not install the SIGTERM handler ({error})");
        }
    });
}

fn on_sigterm() {
    QUIT_REQUESTED.store(true, Ordering::SeqCst);
    let role = ROLE.load(Ordering::SeqCst);
    if role == Role::Guardian as u8 {
        let pid = EXECUTOR_PID.load(Ordering::SeqCst);
        if pid != 0 && !EXECUTOR_KILLED.swap(true, Ordering::SeqCst) {
            unsafe { libc::kill(pid, libc::SIGTERM) };
        }
    } else if role == Role::Executor as u8 {
        let flag = POOL_QUIT.load(Ordering::SeqCst);
        if !flag.is_null() {
            unsafe { &*flag }.store(true, Ordering::SeqCst);
        }
        let pid = GUARDIAN_PID.load(Ordering::SeqCst);
        if pid != 0 && !GUARDIAN_KILLED.swap(true, Ordering::SeqCst) {
            unsafe { libc::kill(pid, libc::SIGTERM) };
        }
    }
    // Workers and untagged processes only record the request.
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn sleep_while_returns_immediately_when_condition_is_false() {
        let started = Instant::now();
        sleep_while(Duration::from_secs(5), || false);
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn sleep_while_runs_to_the_deadline() {
        let started = Instant::now();
        sleep_while(Duration::from_millis(300), || true);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        // One truncated step, not a full extra second.
        assert!(elapsed < Duration::from_millis(900));
    }

    #[test]
    fn sleep_while_stops_within_one_step_of_the_flag_flip() {
        let polls = AtomicUsize::new(0);
        let started = Instant::now();
        sleep_while(Duration::from_secs(10), || {
            polls.fetch_add(1, Ordering::SeqCst) < 2
        });
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
