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

//! Integration tests that drive the `test-daemon` fixture as a real process
//! tree: launching, relaunching, mutual SIGTERM, and worker-pool behavior.

use anyhow::{anyhow, Context, Result};
use std::io::ErrorKind;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use warden::pool::PoolDump;

enum Completion<T> {
    Incomplete,
    Complete(T),
}
use Completion::*;

/// Repeatedly evaluates `condition`, sleeping a bit between calls, until it
/// yields Complete(value), then returns Ok(value).  After a while, however,
/// give up and return an error instead.
fn wait_until<T, F>(mut condition: F) -> Result<T>
where
    F: FnMut() -> Completion<T>,
{
    for i in 0..12 {
        if let Complete(result) = condition() {
            return Ok(result);
        }
        let ms = match i {
            0 => 10,
            1 => 100,
            _ => 1000,
        };
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }
    Err(anyhow!("wait_until timed out"))
}

fn fixture_command() -> Result<Command> {
    let examples_dir = std::env::current_dir()?.join("target/debug/examples");
    Ok(Command::new(examples_dir.join("test-daemon")))
}

/// Runs the fixture and returns the guardian pid it reports on stdout.
fn launch(command: &mut Command) -> Result<libc::pid_t> {
    let output = command.output()?;
    let stdout = String::from_utf8(output.stdout)?;
    anyhow::ensure!(
        output.status.success(),
        "fixture failed: {stdout} {}",
        String::from_utf8_lossy(&output.stderr)
    );
    reported_pid(&stdout)
}

/// Extracts the pid from a "launched, pid = N" or "already running,
/// pid = N" report.
fn reported_pid(stdout: &str) -> Result<libc::pid_t> {
    let tail = stdout
        .trim()
        .rsplit("pid = ")
        .next()
        .ok_or_else(|| anyhow!("no pid in fixture output {stdout:?}"))?;
    tail.parse()
        .with_context(|| format!("parsing fixture output {stdout:?}"))
}

fn send_signal(pid: libc::pid_t, signal: c_int) -> Result<(), std::io::Error> {
    if unsafe { libc::kill(pid, signal) } < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn process_exists(pid: libc::pid_t) -> Result<(), std::io::Error> {
    send_signal(pid, 0)
}

fn read_pidfile<P>(path: P) -> Result<libc::pid_t>
where
    P: AsRef<Path>,
{
    let pidfile_string = String::from_utf8(std::fs::read(path)?)?;
    Ok(pidfile_string.trim().parse()?)
}

/// This won't work if `pid` is our direct child; the fixture's children
/// never are — the fixture host has already exited.
fn wait_for_process_to_die(pid: libc::pid_t) -> Result<()> {
    wait_until(|| match process_exists(pid) {
        Ok(()) => Incomplete,
        Err(_) => Complete(()),
    })
}

fn wait_until_file_exists<P>(path: P) -> Result<()>
where
    P: AsRef<Path>,
{
    wait_until(|| match path.as_ref().exists() {
        true => Complete(()),
        false => Incomplete,
    })?;
    Ok(())
}

fn check_file_does_not_exist<P>(path: P) -> Result<()>
where
    P: AsRef<Path>,
{
    match std::fs::File::open(path.as_ref()) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => Err(anyhow!(
            "{}: expected NotFound, got {other:?}",
            path.as_ref().display()
        ))?,
    }
}

fn wait_until_file_is_gone<P>(path: P) -> Result<()>
where
    P: AsRef<Path>,
{
    wait_until(|| match path.as_ref().exists() {
        false => Complete(()),
        true => Incomplete,
    })
}

/// Waits for `path` to become a pidfile with a pid other than `old_pid`.
/// Returns the new pid.
fn wait_for_pidfile_to_change<P>(path: P, old_pid: libc::pid_t) -> Result<libc::pid_t>
where
    P: AsRef<Path>,
{
    wait_until(|| match read_pidfile(path.as_ref()) {
        Ok(new_pid) if new_pid != old_pid => Complete(new_pid),
        _ => Incomplete,
    })
}

/// Finds the (sole) child of `pid` with `ps`.
fn child_of(pid: libc::pid_t) -> Result<libc::pid_t> {
    let output = Command::new("ps")
        .arg("-o")
        .arg("pid=")
        .arg("--ppid")
        .arg(pid.to_string())
        .output()?;
    let stdout = String::from_utf8(output.stdout)?;
    stdout
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow!("pid {pid} has no children"))?
        .parse()
        .map_err(Into::into)
}

fn wait_for_child_of(pid: libc::pid_t) -> Result<libc::pid_t> {
    wait_until(|| match child_of(pid) {
        Ok(child) => Complete(child),
        Err(_) => Incomplete,
    })
}

fn terminate_daemon<P: AsRef<Path>>(pidfile: P) -> Result<()> {
    let pid = read_pidfile(pidfile.as_ref())?;
    send_signal(pid, libc::SIGTERM)?;
    wait_for_process_to_die(pid)?;
    wait_until_file_is_gone(pidfile)
}

#[test]
fn test_launch_and_terminate() -> Result<()> {
    let dir = TempDir::new()?;
    let pidfile = dir.path().join("daemon.pid");

    let reported = launch(fixture_command()?.arg("--pid").arg(&pidfile).args(["--entry", "idle:main"]))?;
    wait_until_file_exists(&pidfile)?;
    assert_eq!(read_pidfile(&pidfile)?, reported);
    process_exists(reported)?;

    // Kill the daemon and ensure that the pidfile gets deleted.
    send_signal(reported, libc::SIGTERM)?;
    wait_for_process_to_die(reported)?;
    wait_until_file_is_gone(&pidfile)?;
    Ok(())
}

#[test]
fn test_second_launch_reports_already_running() -> Result<()> {
    let dir = TempDir::new()?;
    let pidfile = dir.path().join("daemon.pid");

    let first = launch(fixture_command()?.arg("--pid").arg(&pidfile).args(["--entry", "idle:main"]))?;
    wait_until_file_exists(&pidfile)?;

    let output = fixture_command()?
        .arg("--pid")
        .arg(&pidfile)
        .args(["--entry", "idle:main"])
        .output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert!(
        stdout.contains("already running"),
        "unexpected output {stdout:?}"
    );
    assert_eq!(reported_pid(&stdout)?, first);

    terminate_daemon(&pidfile)
}

// A daemon whose entry returns immediately: no relaunch, clean exit, pid
// file removed.
#[test]
fn test_oneshot_completes_and_cleans_up() -> Result<()> {
    let dir = TempDir::new()?;
    let pidfile = dir.path().join("daemon.pid");

    let guardian = launch(fixture_command()?.arg("--pid").arg(&pidfile).args(["--entry", "oneshot:main"]))?;
    wait_for_process_to_die(guardian)?;
    wait_until_file_is_gone(&pidfile)?;
    Ok(())
}

// A constantly failing entry with a 1-second back-off: at least two launch
// attempts land in the log, and SIGTERM still tears everything down.
#[test]
fn test_failing_entry_is_relaunched() -> Result<()> {
    let dir = TempDir::new()?;
    let pidfile = dir.path().join("daemon.pid");
    let logfile = dir.path().join("guardian.log");

    let guardian = launch(
        fixture_command()?
            .arg("--pid")
            .arg(&pidfile)
            .arg("--log")
            .arg(&logfile)
            .args(["--entry", "fail:main", "--restart-secs", "1"]),
    )?;
    wait_until_file_exists(&pidfile)?;
    std::thread::sleep(std::time::Duration::from_secs(3));

    send_signal(guardian, libc::SIGTERM)?;
    wait_for_process_to_die(guardian)?;
    wait_until_file_is_gone(&pidfile)?;

    let log = std::fs::read_to_string(&logfile)?;
    let launches = log.matches("guardian: launching executor").count();
    assert!(launches >= 2, "only {launches} launch attempts in {log}");
    Ok(())
}

// SIGTERM on the guardian takes the executor down with it and no relaunch
// happens afterwards.
#[test]
fn test_sigterm_guardian_takes_down_executor() -> Result<()> {
    let dir = TempDir::new()?;
    let pidfile = dir.path().join("daemon.pid");

    let guardian = launch(
        fixture_command()?
            .arg("--pid")
            .arg(&pidfile)
            .args(["--entry", "idle:main", "--restart-secs", "1"]),
    )?;
    wait_until_file_exists(&pidfile)?;
    let executor = wait_for_child_of(guardian)?;

    send_signal(guardian, libc::SIGTERM)?;
    wait_for_process_to_die(guardian)?;
    wait_for_process_to_die(executor)?;
    wait_until_file_is_gone(&pidfile)?;

    // Relaunching would need a living guardian; make sure nothing came back.
    std::thread::sleep(std::time::Duration::from_millis(1500));
    check_file_does_not_exist(&pidfile)?;
    Ok(())
}

// SIGTERM on the executor also stops the guardian, without a relaunch even
// though one is configured.
#[test]
fn test_sigterm_executor_prevents_relaunch() -> Result<()> {
    let dir = TempDir::new()?;
    let pidfile = dir.path().join("daemon.pid");

    let guardian = launch(
        fixture_command()?
            .arg("--pid")
            .arg(&pidfile)
            .args(["--entry", "idle:main", "--restart-secs", "1"]),
    )?;
    wait_until_file_exists(&pidfile)?;
    let executor = wait_for_child_of(guardian)?;

    send_signal(executor, libc::SIGTERM)?;
    wait_for_process_to_die(executor)?;
    wait_for_process_to_die(guardian)?;
    wait_until_file_is_gone(&pidfile)?;
    Ok(())
}

fn launch_pool(dir: &Path) -> Result<(PathBuf, libc::pid_t)> {
    let pidfile = dir.join("daemon.pid");
    let guardian = launch(
        fixture_command()?
            .arg("--pid")
            .arg(&pidfile)
            .arg("--scratch")
            .arg(dir)
            .arg("--log")
            .arg(dir.join("guardian.log"))
            .args(["--entry", "pool:main"]),
    )?;
    wait_until_file_exists(dir.join("a.pid"))?;
    wait_until_file_exists(dir.join("b.pid"))?;
    Ok((pidfile, guardian))
}

// A SIGKILLed worker is replaced after the back-off, and both deaths show up
// in the state dump's history.
#[test]
fn test_pool_respawns_killed_worker() -> Result<()> {
    let dir = TempDir::new()?;
    let (pidfile, _guardian) = launch_pool(dir.path())?;
    let worker_pidfile = dir.path().join("a.pid");

    let first = read_pidfile(&worker_pidfile)?;
    send_signal(first, libc::SIGKILL)?;
    let second = wait_for_pidfile_to_change(&worker_pidfile, first)?;
    assert_ne!(first, second);

    send_signal(second, libc::SIGKILL)?;
    wait_for_pidfile_to_change(&worker_pidfile, second)?;

    let dump: PoolDump = wait_until(|| {
        let Ok(payload) = std::fs::read_to_string(dir.path().join("pool.json")) else {
            return Incomplete;
        };
        match serde_json::from_str::<PoolDump>(&payload) {
            Ok(dump)
                if dump
                    .worker_info_list
                    .first()
                    .map_or(false, |slot| slot.history.len() >= 2) =>
            {
                Complete(dump)
            }
            _ => Incomplete,
        }
    })?;
    assert!(!dump.updated_at.is_empty());
    assert_eq!(dump.worker_info_list.len(), 2);
    let slot_a = &dump.worker_info_list[0];
    assert_eq!(slot_a.name, "a");
    assert_eq!(slot_a.history[0].pid, first);
    assert_eq!(slot_a.history[0].exit_code, 128 + libc::SIGKILL);
    // The dump was written in the pass that started the replacement, so its
    // pid field names the worker now running.
    assert_eq!(slot_a.pid, Some(read_pidfile(&worker_pidfile)?));

    terminate_daemon(&pidfile)?;
    // Pool shutdown reaches the workers through the shared flag; they clean
    // up their own pidfiles on the way out.
    wait_until_file_is_gone(worker_pidfile)?;
    wait_until_file_is_gone(dir.path().join("b.pid"))?;
    Ok(())
}

// SIGTERM delivered straight to one worker stops only that worker; the pool
// notices, backs off, and respawns it while its sibling keeps running.
#[test]
fn test_sigterm_worker_respawns_alone() -> Result<()> {
    let dir = TempDir::new()?;
    let (pidfile, _guardian) = launch_pool(dir.path())?;

    let a_before = read_pidfile(dir.path().join("a.pid"))?;
    let b_before = read_pidfile(dir.path().join("b.pid"))?;

    send_signal(b_before, libc::SIGTERM)?;
    wait_for_process_to_die(b_before)?;
    let b_after = wait_for_pidfile_to_change(dir.path().join("b.pid"), b_before)?;
    assert_ne!(b_before, b_after);

    // The sibling never noticed.
    assert_eq!(read_pidfile(dir.path().join("a.pid"))?, a_before);
    process_exists(a_before)?;

    terminate_daemon(&pidfile)
}

// Duplicate worker names abort the pool before anything is spawned.
#[test]
fn test_duplicate_worker_names_are_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let pidfile = dir.path().join("daemon.pid");

    let guardian = launch(
        fixture_command()?
            .arg("--pid")
            .arg(&pidfile)
            .arg("--scratch")
            .arg(dir.path())
            .args(["--entry", "duplicate-pool:main"]),
    )?;
    wait_until_file_exists(dir.path().join("rejected"))?;
    check_file_does_not_exist(dir.path().join("x.pid"))?;

    wait_for_process_to_die(guardian)?;
    wait_until_file_is_gone(&pidfile)?;
    Ok(())
}

// A pid file with contents is taken at face value: no probe, no fork, no
// side effects.
#[test]
fn test_occupied_pidfile_blocks_launch() -> Result<()> {
    let dir = TempDir::new()?;
    let pidfile = dir.path().join("daemon.pid");
    std::fs::write(&pidfile, "12345\n")?;

    let output = fixture_command()?
        .arg("--pid")
        .arg(&pidfile)
        .args(["--entry", "idle:main"])
        .output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert!(
        stdout.contains("already running"),
        "unexpected output {stdout:?}"
    );
    assert_eq!(reported_pid(&stdout)?, 12345);
    assert_eq!(std::fs::read_to_string(&pidfile)?, "12345\n");
    Ok(())
}
