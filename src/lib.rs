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

//! Utilities for running an entry point as a supervised daemon process tree.
//!
//! Launching a daemon involves three processes:
//!
//!   - The "host process", the one that calls [`start_daemon`].  It checks
//!     the pid file, opens the redirection targets, forks the guardian, and
//!     reports a [`RunStatus`] to its caller.  It never runs user code, and
//!     because the expensive checks happen before the fork, the caller gets
//!     a meaningful status synchronously.
//!
//!   - The "guardian process", forked from the host.  It detaches into its
//!     own session, owns the pid file the caller named, and relaunches the
//!     executor whenever it exits unsuccessfully, waiting out the configured
//!     back-off between attempts.
//!
//!   - The "executor process", forked from the guardian.  It resolves the
//!     entry identifier against the [registry](crate::registry) and runs the
//!     user's code.  An executor that wants to fan out further can call
//!     [`run_workers`](crate::pool::run_workers), which supervises a fixed
//!     pool of named worker processes with the same guarantees.
//!
//! Shutdown is cooperative throughout.  SIGTERM on either the guardian or
//! the executor makes the pair take each other down exactly once and then
//! drain naturally; user code is expected to poll
//! [`EntryContext::quit_requested`] and return promptly.  No process is ever
//! force-killed by the supervisor.
//!
//! ```no_run
//! use std::time::Duration;
//! use warden::{register, start_daemon, DaemonSpec, Entry, RunStatus};
//!
//! fn serve(ctx: &warden::EntryContext) -> anyhow::Result<()> {
//!     while !ctx.quit_requested() {
//!         // ...do one unit of work...
//!         ctx.sleep(Duration::from_secs(5));
//!     }
//!     Ok(())
//! }
//!
//! register("server:main", Entry::new(serve));
//! let spec = DaemonSpec {
//!     pid_filename: "server.pid".into(),
//!     entry: "server:main".to_string(),
//!     restart_interval: Some(Duration::from_secs(10)),
//!     ..DaemonSpec::default()
//! };
//! match unsafe { start_daemon(&spec) } {
//!     RunStatus::Launched(pid) => println!("running as pid {pid}"),
//!     status => eprintln!("not launched: {status:?}"),
//! }
//! ```

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context;
use tracing::{event, Level};

pub mod context;
pub mod logging;
pub mod pidfile;
pub mod pool;
pub mod registry;
pub mod stdio;
mod sys;

pub use context::{quit_requested, sleep};
pub use logging::LogConfig;
pub use pool::{run_workers, PoolError, PoolOptions, WorkerSpec};
pub use registry::{register, Entry, EntryArgs, EntryContext, ResolveError};

use stdio::{OpenError, RedirectTargets};

/// Everything needed to launch one daemon.
#[derive(Clone, Debug, Default)]
pub struct DaemonSpec {
    /// The pid file acting as the daemon's identity.
    pub pid_filename: PathBuf,
    /// Entry identifier of the form `"module:symbol"`.
    pub entry: String,
    /// Opaque arguments handed to the entry.
    pub args: EntryArgs,
    /// Where standard output goes; the null device when absent.
    pub stdout_filename: Option<PathBuf>,
    /// Where standard error goes; may name the same file as stdout.
    pub stderr_filename: Option<PathBuf>,
    pub logging: LogConfig,
    /// Back-off before a failed executor is relaunched; `None` disables
    /// relaunching.
    pub restart_interval: Option<Duration>,
}

/// What [`start_daemon`] reports back to its caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    /// The guardian was forked; the daemon is coming up under this pid.
    Launched(libc::pid_t),
    /// The pid file already names a daemon.
    AlreadyRunning(libc::pid_t),
    /// The stdout target could not be opened.
    RedirStdoutFailed,
    /// The stderr target could not be opened.
    RedirStderrFailed,
    /// The OS refused to fork the guardian.
    ForkFailed,
    /// The entry identifier is not registered.
    LaunchFailed,
}

/// Launches the daemon described by `spec` and reports how that went.
///
/// The pid file is trusted as-is: if it holds an integer the daemon is
/// considered running and no liveness probe is made, so a file left behind
/// by a crashed machine is the operator's to clean up.  On `Launched` the
/// caller's process is untouched; the forked guardian redirects its standard
/// streams, detaches into its own session, writes the pid file, and runs the
/// executor under the relaunch policy.  The guardian never returns to the
/// caller.
///
/// # Safety
///
/// This function forks: any threads other than the calling one are dead in
/// the child, so it must only be called while the process is
/// single-threaded, and it will assert-fail otherwise.  About all a program
/// should do beforehand is parse its command line and register its entries.
pub unsafe fn start_daemon(spec: &DaemonSpec) -> RunStatus {
    if let Some(pid) = pidfile::read(&spec.pid_filename) {
        return RunStatus::AlreadyRunning(pid);
    }
    if registry::resolve(&spec.entry).is_err() {
        return RunStatus::LaunchFailed;
    }

    let targets = match RedirectTargets::open(
        spec.stdout_filename.as_deref(),
        spec.stderr_filename.as_deref(),
    ) {
        Ok(targets) => targets,
        Err(OpenError::Stderr(_)) => return RunStatus::RedirStderrFailed,
        Err(_) => return RunStatus::RedirStdoutFailed,
    };

    sys::assert_single_threaded();
    match sys::fork() {
        Err(_) => RunStatus::ForkFailed,
        // The parent drops the targets, closing them, and reports back.
        Ok(Some(pid)) => RunStatus::Launched(pid),
        Ok(None) => guardian_main(spec, targets),
    }
}

/// Entry point of the guardian.  Never returns.
fn guardian_main(spec: &DaemonSpec, targets: RedirectTargets) -> ! {
    let code = match guardian_run(spec, targets) {
        Ok(()) => 0,
        Err(error) => {
            event!(Level::ERROR, "guardian: failed ({error:#})");
            1
        }
    };
    process::exit(code)
}

fn guardian_run(spec: &DaemonSpec, targets: RedirectTargets) -> anyhow::Result<()> {
    targets
        .apply()
        .context("could not redirect the standard streams")?;
    sys::setsid().context("could not become a session leader")?;
    sys::umask(0);

    pidfile::write(&spec.pid_filename, sys::getpid())
        .with_context(|| format!("{}: could not write pid file", spec.pid_filename.display()))?;
    // Only the guardian deletes the pid file, whichever way it leaves.
    let _pidfile = pidfile::RemoveOnDrop::new(&spec.pid_filename);

    logging::apply(&spec.logging);
    context::enter_guardian();
    event!(
        Level::DEBUG,
        "guardian: initialized, pid {}, entry {}, relaunch {:?}",
        sys::getpid(),
        spec.entry,
        spec.restart_interval
    );

    supervise_executor(spec)
}

/// The executor supervision loop: fork the executor, wait for it, apply the
/// relaunch policy.
fn supervise_executor(spec: &DaemonSpec) -> anyhow::Result<()> {
    let mut launches = 0u32;
    loop {
        if context::quit_requested() {
            event!(Level::DEBUG, "guardian: quit requested, leaving the relaunch loop");
            break;
        }

        event!(Level::DEBUG, "guardian: launching executor");
        // SAFETY: the guardian is single-threaded; it was forked from a
        // single-threaded host and starts no threads of its own.
        let pid = match unsafe { sys::fork() }.context("could not fork the executor")? {
            None => executor_main(spec),
            Some(pid) => pid,
        };
        launches += 1;

        context::set_executor_pid(pid);
        let (_, status) = sys::waitpid(pid).context("waitpid on the executor failed")?;
        context::clear_executor_pid();
        event!(
            Level::DEBUG,
            "guardian: executor (pid {pid}) finished with {status} after {launches} launches"
        );

        if status.success() {
            event!(Level::DEBUG, "guardian: executor completed, leaving the relaunch loop");
            break;
        }
        let Some(interval) = spec.restart_interval else {
            event!(Level::DEBUG, "guardian: relaunch disabled, leaving the relaunch loop");
            break;
        };
        event!(
            Level::DEBUG,
            "guardian: sleeping {}s before the next launch",
            interval.as_secs()
        );
        context::sleep(interval);
    }
    event!(Level::DEBUG, "guardian: exit");
    Ok(())
}

/// Entry point of the executor.  Never returns.
fn executor_main(spec: &DaemonSpec) -> ! {
    context::enter_executor(sys::getppid(), sys::getpid());
    logging::apply(&spec.logging);
    let code = executor_run(spec);
    process::exit(code)
}

fn executor_run(spec: &DaemonSpec) -> i32 {
    event!(
        Level::DEBUG,
        "executor: pid {}, guardian pid {}, entry {}",
        sys::getpid(),
        sys::getppid(),
        spec.entry
    );

    let entry = match registry::resolve(&spec.entry) {
        Ok(entry) => entry,
        Err(error) => {
            event!(Level::ERROR, "executor: {error}");
            return 1;
        }
    };
    let ctx = EntryContext::new(&spec.args, context::quit_requested);
    match (entry.run)(&ctx) {
        Ok(()) => {
            event!(Level::DEBUG, "executor: {} succeeded", spec.entry);
            0
        }
        Err(error) => {
            event!(Level::ERROR, "executor: {} failed ({error:#})", spec.entry);
            registry::run_error_hook(&entry, &ctx, &error);
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn occupied_pid_file_reports_already_running() {
        let dir = TempDir::new().unwrap();
        let pid_filename = dir.path().join("daemon.pid");
        std::fs::write(&pid_filename, "12345\n").unwrap();

        let spec = DaemonSpec {
            pid_filename: pid_filename.clone(),
            entry: "lib-tests:unregistered".to_string(),
            ..DaemonSpec::default()
        };
        // Returns before any fork, so this is safe to call from the test
        // harness.
        assert_eq!(
            unsafe { start_daemon(&spec) },
            RunStatus::AlreadyRunning(12345)
        );
        // The file is left untouched.
        assert_eq!(std::fs::read_to_string(&pid_filename).unwrap(), "12345\n");
    }

    #[test]
    fn unregistered_entry_fails_the_launch() {
        let dir = TempDir::new().unwrap();
        let spec = DaemonSpec {
            pid_filename: dir.path().join("daemon.pid"),
            entry: "lib-tests:unregistered".to_string(),
            ..DaemonSpec::default()
        };
        assert_eq!(unsafe { start_daemon(&spec) }, RunStatus::LaunchFailed);
        assert!(!spec.pid_filename.exists());
    }

    #[test]
    fn unopenable_stdout_target_is_reported() {
        let dir = TempDir::new().unwrap();
        registry::register("lib-tests:idle", Entry::new(|_| Ok(())));
        let spec = DaemonSpec {
            pid_filename: dir.path().join("daemon.pid"),
            entry: "lib-tests:idle".to_string(),
            stdout_filename: Some(dir.path().join("no/such/dir/out.txt")),
            ..DaemonSpec::default()
        };
        assert_eq!(unsafe { start_daemon(&spec) }, RunStatus::RedirStdoutFailed);
    }
}
