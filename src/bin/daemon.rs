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

//! Daemon launch tool: runs a registered entry point in the background.

use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{event, Level};

use warden::{
    register, start_daemon, DaemonSpec, Entry, EntryArgs, EntryContext, LogConfig, RunStatus,
};

#[derive(Parser, Debug)]
#[clap(version, about = "Launch a registered entry point as a supervised daemon")]
struct Args {
    /// File the supervisor writes its log to; stderr when omitted.
    #[clap(long)]
    log: Option<PathBuf>,

    /// Pid file identifying the daemon instance.
    #[clap(long, default_value = "daemon.pid")]
    pid: PathBuf,

    /// File standard output is appended to.
    #[clap(long, default_value = "/dev/stdout")]
    stdout: PathBuf,

    /// File standard error is appended to.
    #[clap(long, default_value = "/dev/stderr")]
    stderr: PathBuf,

    /// Entry identifier of the form "module:symbol".
    #[clap(short, long)]
    entry: String,

    /// Seconds to wait before relaunching a failed entry; omit to disable
    /// relaunching.
    #[clap(long)]
    restart_secs: Option<u64>,
}

/// Built-in entry that logs a heartbeat once a second until asked to stop.
/// Handy for smoke-testing a deployment of the launch tool itself.
fn heartbeat(ctx: &EntryContext) -> Result<()> {
    while !ctx.quit_requested() {
        event!(Level::INFO, "heartbeat, pid {}", std::process::id());
        ctx.sleep(Duration::from_secs(1));
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    register("heartbeat:main", Entry::new(heartbeat));

    let spec = DaemonSpec {
        pid_filename: args.pid.clone(),
        entry: args.entry,
        args: EntryArgs::new(),
        stdout_filename: Some(args.stdout),
        stderr_filename: Some(args.stderr),
        logging: LogConfig {
            filename: args.log,
            level: Some("debug".to_string()),
        },
        restart_interval: args.restart_secs.map(Duration::from_secs),
    };

    match unsafe { start_daemon(&spec) } {
        RunStatus::Launched(pid) => {
            println!("daemon launched, pid = {pid}, pid file = {}", args.pid.display())
        }
        RunStatus::AlreadyRunning(pid) => println!("daemon is already running, pid = {pid}"),
        status => {
            eprintln!("unable to launch daemon ({status:?})");
            exit(1);
        }
    }
}
