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

//! A fixed pool of named worker processes supervised from the executor.
//!
//! Each slot cycles through three states: idle, running a child, and backing
//! off after a failed child.  One pass of the supervision loop reaps the
//! slots whose child has exited, then starts every slot whose back-off timer
//! has elapsed, then dumps the pool state if anything changed, then sleeps
//! cooperatively for the check interval.  Shutdown travels to the children
//! through a flag in shared memory — the children cannot see this process's
//! memory, so an ordinary atomic would not reach them.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use chrono::{DateTime, Utc};
use libc::pid_t;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{event, Level};

use crate::context;
use crate::logging::{self, LogConfig};
use crate::pidfile;
use crate::registry::{self, EntryArgs, EntryContext};
use crate::stdio::RedirectTargets;
use crate::sys::{self, SharedFlag};

/// Timestamp layout used in the pool state dump.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Exits a slot keeps on record before the oldest is dropped.
const HISTORY_LIMIT: usize = 64;

/// Everything needed to run one named worker.
#[derive(Clone, Debug)]
pub struct WorkerSpec {
    pub pid_filename: PathBuf,
    pub entry: String,
    /// Unique within the pool.
    pub name: String,
    pub args: EntryArgs,
    pub logging: LogConfig,
    pub stdout_filename: Option<PathBuf>,
    pub stderr_filename: Option<PathBuf>,
}

/// Knobs for the pool supervision loop.
#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// Where to dump the pool state whenever a slot changes.
    pub debug_filename: Option<PathBuf>,
    /// How long one pass sleeps before looking at the slots again.
    pub check_interval: Duration,
    /// Back-off before a failed worker is started again; `None` disables
    /// restarting.
    pub restart_interval: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> PoolOptions {
        PoolOptions {
            debug_filename: None,
            check_interval: Duration::from_secs(60),
            restart_interval: Some(Duration::from_secs(300)),
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("duplicate worker name {0:?}")]
    DuplicateName(String),
    #[error("could not allocate the shared quit flag: {0}")]
    SharedFlag(#[from] io::Error),
}

/// One finished run of a worker child.
#[derive(Clone, Debug)]
struct HistoryRecord {
    pid: pid_t,
    exit_code: i32,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

/// One slot of the pool.
struct WorkerState {
    index: usize,
    spec: WorkerSpec,
    child: Option<pid_t>,
    start_time: Option<DateTime<Utc>>,
    start_after: Option<DateTime<Utc>>,
    history: Vec<HistoryRecord>,
}

impl WorkerState {
    fn new(index: usize, spec: WorkerSpec) -> WorkerState {
        WorkerState {
            index,
            spec,
            child: None,
            start_time: None,
            start_after: None,
            history: Vec::new(),
        }
    }

    /// A slot may start when it has no child and either has never run or its
    /// back-off timer has elapsed.
    fn can_start(&self, now: DateTime<Utc>) -> bool {
        if self.child.is_some() {
            return false;
        }
        if self.history.is_empty() {
            return true;
        }
        matches!(self.start_after, Some(after) if now >= after)
    }

    /// A slot that has run, has no child, and has no pending restart will
    /// never start again.
    fn is_terminal(&self) -> bool {
        self.child.is_none() && !self.history.is_empty() && self.start_after.is_none()
    }

    fn record_exit(
        &mut self,
        pid: pid_t,
        exit_code: i32,
        now: DateTime<Utc>,
        restart_interval: Option<Duration>,
    ) {
        self.history.push(HistoryRecord {
            pid,
            exit_code,
            start_time: self.start_time,
            end_time: Some(now),
        });
        if self.history.len() > HISTORY_LIMIT {
            self.history.remove(0);
        }
        self.child = None;
        self.start_time = None;
        // Only a failed child earns a back-off timer; a clean exit makes the
        // slot terminal.
        self.start_after = if exit_code != 0 {
            restart_interval
                .and_then(|interval| chrono::Duration::from_std(interval).ok())
                .map(|interval| now + interval)
        } else {
            None
        };
    }

    fn dump(&self) -> WorkerDump {
        WorkerDump {
            index: self.index,
            entry: self.spec.entry.clone(),
            name: self.spec.name.clone(),
            stdout_filename: self
                .spec
                .stdout_filename
                .as_ref()
                .map(|p| p.display().to_string()),
            stderr_filename: self
                .spec
                .stderr_filename
                .as_ref()
                .map(|p| p.display().to_string()),
            pid: self.child,
            start_after: self.start_after.as_ref().map(format_timestamp),
            start_time: self.start_time.as_ref().map(format_timestamp),
            history: self
                .history
                .iter()
                .map(|record| HistoryDump {
                    pid: record.pid,
                    exit_code: record.exit_code,
                    start_time: record.start_time.as_ref().map(format_timestamp),
                    end_time: record.end_time.as_ref().map(format_timestamp),
                })
                .collect(),
        }
    }
}

/// One history record as it appears in the pool state dump.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryDump {
    pub pid: pid_t,
    pub exit_code: i32,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

/// One slot as it appears in the pool state dump.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDump {
    pub index: usize,
    pub entry: String,
    pub name: String,
    pub stdout_filename: Option<String>,
    pub stderr_filename: Option<String>,
    pub pid: Option<pid_t>,
    pub start_after: Option<String>,
    pub start_time: Option<String>,
    pub history: Vec<HistoryDump>,
}

/// The pool state dump document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDump {
    pub updated_at: String,
    pub worker_info_list: Vec<WorkerDump>,
}

fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

fn check_unique_names(specs: &[WorkerSpec]) -> Result<(), PoolError> {
    let mut seen = HashSet::new();
    for spec in specs {
        if !seen.insert(spec.name.as_str()) {
            return Err(PoolError::DuplicateName(spec.name.clone()));
        }
    }
    Ok(())
}

/// Runs a fixed pool of workers until shutdown is requested or every slot is
/// permanently finished.  Duplicate worker names abort the pool before
/// anything is spawned.
///
/// # Safety
///
/// Forks once per worker start.  Must only be called while the process is
/// single-threaded.
pub unsafe fn run_workers(specs: Vec<WorkerSpec>, options: &PoolOptions) -> Result<(), PoolError> {
    check_unique_names(&specs)?;

    let mut slots: Vec<WorkerState> = specs
        .into_iter()
        .enumerate()
        .map(|(index, spec)| WorkerState::new(index, spec))
        .collect();

    let pool_quit = SharedFlag::new()?;
    context::set_pool_quit(&pool_quit);

    event!(Level::DEBUG, "pool: supervising {} workers", slots.len());
    loop {
        if context::quit_requested() {
            event!(Level::DEBUG, "pool: quit requested, leaving the loop");
            break;
        }
        if slots.iter().all(WorkerState::is_terminal) {
            event!(Level::DEBUG, "pool: every slot is finished, leaving the loop");
            break;
        }

        let mut changed = false;

        // Reap before starting so an exit and the replacement it earns land
        // in the same pass.
        for slot in &mut slots {
            let Some(pid) = slot.child else { continue };
            match sys::waitpid_nohang(pid) {
                Ok(None) => {}
                Ok(Some(status)) => {
                    let exit_code = sys::exit_code(&status);
                    event!(
                        Level::DEBUG,
                        "pool: worker[{}]({pid}) exited with code {exit_code}",
                        slot.index
                    );
                    slot.record_exit(pid, exit_code, Utc::now(), options.restart_interval);
                    changed = true;
                }
                Err(error) => {
                    event!(
                        Level::ERROR,
                        "pool: waitpid on worker[{}]({pid}) failed ({error})",
                        slot.index
                    );
                    slot.record_exit(pid, 1, Utc::now(), options.restart_interval);
                    changed = true;
                }
            }
        }

        for slot in &mut slots {
            if context::quit_requested() {
                break;
            }
            if !slot.can_start(Utc::now()) {
                continue;
            }
            match spawn_worker(slot, pool_quit) {
                Ok(pid) => {
                    event!(Level::DEBUG, "pool: worker[{}]({pid}) started", slot.index);
                    slot.child = Some(pid);
                    slot.start_time = Some(Utc::now());
                    changed = true;
                }
                Err(error) => {
                    event!(
                        Level::ERROR,
                        "pool: could not start worker[{}] ({error})",
                        slot.index
                    );
                }
            }
        }

        if changed {
            if let Some(ref path) = options.debug_filename {
                write_dump(path, &snapshot(&slots));
            }
        }

        context::sleep(options.check_interval);
    }

    // Tell the children to stop, then wait for each slot's own child.
    pool_quit.set();
    for slot in &mut slots {
        match slot.child.take() {
            None => event!(Level::DEBUG, "pool: worker[{}] already finished", slot.index),
            Some(pid) => {
                event!(
                    Level::DEBUG,
                    "pool: waiting for worker[{}]({pid}) to finish",
                    slot.index
                );
                if let Err(error) = sys::waitpid(pid) {
                    event!(
                        Level::WARN,
                        "pool: waitpid on worker[{}]({pid}) failed ({error})",
                        slot.index
                    );
                }
            }
        }
    }
    event!(Level::DEBUG, "pool: exit");
    Ok(())
}

fn snapshot(slots: &[WorkerState]) -> PoolDump {
    PoolDump {
        updated_at: format_timestamp(&Utc::now()),
        worker_info_list: slots.iter().map(WorkerState::dump).collect(),
    }
}

/// Best-effort dump of the pool state: written next to the target and
/// renamed over it, so readers never observe a half-written document.
fn write_dump(path: &Path, dump: &PoolDump) {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = serde_json::to_string(dump)
        .map_err(io::Error::from)
        .and_then(|payload| std::fs::write(&tmp, payload))
        .and_then(|()| std::fs::rename(&tmp, path));
    match result {
        Ok(()) => event!(Level::DEBUG, "pool: state dumped to {}", path.display()),
        Err(error) => event!(
            Level::WARN,
            "pool: could not dump state to {} ({error})",
            path.display()
        ),
    }
}

fn spawn_worker(slot: &WorkerState, pool_quit: SharedFlag) -> io::Result<pid_t> {
    // SAFETY: the supervision loop is single-threaded by contract of
    // run_workers.
    match unsafe { sys::fork() }? {
        Some(pid) => Ok(pid),
        None => worker_main(&slot.spec, pool_quit),
    }
}

/// Entry point of a worker child.  Never returns.
fn worker_main(spec: &WorkerSpec, pool_quit: SharedFlag) -> ! {
    logging::apply(&spec.logging);
    let code = worker_run(spec, pool_quit);
    process::exit(code)
}

fn worker_run(spec: &WorkerSpec, pool_quit: SharedFlag) -> i32 {
    if let Err(error) = pidfile::write(&spec.pid_filename, sys::getpid()) {
        event!(
            Level::ERROR,
            "worker {}: could not write {} ({error})",
            spec.name,
            spec.pid_filename.display()
        );
        return 1;
    }
    let _pidfile = pidfile::RemoveOnDrop::new(&spec.pid_filename);

    let targets = match RedirectTargets::open(
        spec.stdout_filename.as_deref(),
        spec.stderr_filename.as_deref(),
    ) {
        Ok(targets) => targets,
        Err(error) => {
            event!(Level::ERROR, "worker {}: {error}", spec.name);
            return 1;
        }
    };
    if let Err(error) = targets.apply() {
        event!(
            Level::ERROR,
            "worker {}: could not redirect standard streams ({error})",
            spec.name
        );
        return 1;
    }

    context::enter_worker(&pool_quit);

    let entry = match registry::resolve(&spec.entry) {
        Ok(entry) => entry,
        Err(error) => {
            event!(Level::ERROR, "worker {}: {error}", spec.name);
            return 1;
        }
    };
    let ctx = EntryContext::new(&spec.args, context::quit_requested);
    match (entry.run)(&ctx) {
        Ok(()) => {
            if context::local_quit_requested() && !pool_quit.get() {
                // Told to stop individually: report as interrupted so the
                // supervisor schedules a replacement.
                event!(Level::DEBUG, "worker {}: stopped by signal", spec.name);
                1
            } else {
                event!(Level::DEBUG, "worker {}: {} succeeded", spec.name, spec.entry);
                0
            }
        }
        Err(error) => {
            event!(
                Level::ERROR,
                "worker {}: {} failed ({error:#})",
                spec.name,
                spec.entry
            );
            registry::run_error_hook(&entry, &ctx, &error);
            1
        }
    }
}
