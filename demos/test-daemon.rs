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

//! Fixture daemon driven by the integration tests.  Registers a handful of
//! entries with known behavior and launches whichever one the test names.

use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::Parser;

use warden::{
    register, run_workers, start_daemon, DaemonSpec, Entry, EntryArgs, EntryContext, LogConfig,
    PoolOptions, RunStatus, WorkerSpec,
};

#[derive(Parser, Debug)]
#[clap(about = "Fixture daemon for the integration tests")]
struct Args {
    #[clap(long)]
    pid: PathBuf,

    #[clap(short, long)]
    entry: String,

    #[clap(long)]
    log: Option<PathBuf>,

    #[clap(long)]
    stdout: Option<PathBuf>,

    #[clap(long)]
    stderr: Option<PathBuf>,

    #[clap(long)]
    restart_secs: Option<u64>,

    /// Scratch directory handed to pool entries through the argument map.
    #[clap(long)]
    scratch: Option<PathBuf>,
}

/// Polls for quit forever.
fn idle(ctx: &EntryContext) -> Result<()> {
    while !ctx.quit_requested() {
        ctx.sleep(Duration::from_secs(60));
    }
    Ok(())
}

/// Returns immediately.
fn oneshot(_ctx: &EntryContext) -> Result<()> {
    Ok(())
}

/// Fails immediately, so the guardian's relaunch policy has something to do.
fn fail(_ctx: &EntryContext) -> Result<()> {
    bail!("told to fail")
}

fn scratch_dir(ctx: &EntryContext) -> Result<PathBuf> {
    ctx.arg_str("scratch")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("missing \"scratch\" argument"))
}

fn worker_spec(scratch: &Path, name: &str) -> WorkerSpec {
    WorkerSpec {
        pid_filename: scratch.join(format!("{name}.pid")),
        entry: "idle:main".to_string(),
        name: name.to_string(),
        args: EntryArgs::new(),
        logging: LogConfig {
            filename: Some(scratch.join(format!("{name}.log"))),
            level: Some("debug".to_string()),
        },
        stdout_filename: None,
        stderr_filename: None,
    }
}

/// Supervises two idle workers with fast check and back-off intervals.
fn pool(ctx: &EntryContext) -> Result<()> {
    let scratch = scratch_dir(ctx)?;
    let specs = vec![worker_spec(&scratch, "a"), worker_spec(&scratch, "b")];
    let options = PoolOptions {
        debug_filename: Some(scratch.join("pool.json")),
        check_interval: Duration::from_secs(1),
        restart_interval: Some(Duration::from_secs(2)),
    };
    unsafe { run_workers(specs, &options) }?;
    Ok(())
}

/// Hands the pool two workers with the same name and reports whether that
/// was rejected without anything being spawned.
fn duplicate_pool(ctx: &EntryContext) -> Result<()> {
    let scratch = scratch_dir(ctx)?;
    let specs = vec![worker_spec(&scratch, "x"), worker_spec(&scratch, "x")];
    match unsafe { run_workers(specs, &PoolOptions::default()) } {
        Err(_) => {
            std::fs::write(scratch.join("rejected"), b"duplicate names rejected\n")?;
            Ok(())
        }
        Ok(()) => bail!("duplicate worker names were accepted"),
    }
}

fn register_entries() {
    register("idle:main", Entry::new(idle));
    register("oneshot:main", Entry::new(oneshot));
    register("fail:main", Entry::new(fail));
    register("pool:main", Entry::new(pool));
    register("duplicate-pool:main", Entry::new(duplicate_pool));
}

fn main() {
    let args = Args::parse();
    register_entries();

    let mut entry_args = EntryArgs::new();
    if let Some(ref scratch) = args.scratch {
        entry_args.insert(
            "scratch".to_string(),
            serde_json::Value::from(scratch.display().to_string()),
        );
    }

    let spec = DaemonSpec {
        pid_filename: args.pid,
        entry: args.entry,
        args: entry_args,
        stdout_filename: args.stdout,
        stderr_filename: args.stderr,
        logging: LogConfig {
            filename: args.log,
            level: Some("debug".to_string()),
        },
        restart_interval: args.restart_secs.map(Duration::from_secs),
    };

    match unsafe { start_daemon(&spec) } {
        RunStatus::Launched(pid) => println!("launched, pid = {pid}"),
        RunStatus::AlreadyRunning(pid) => println!("already running, pid = {pid}"),
        status => {
            eprintln!("launch failed ({status:?})");
            exit(1);
        }
    }
}
