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

//! Pid files: a decimal PID and a newline.
//!
//! A pid file is created and deleted only by the process whose PID it holds;
//! everyone else treats its contents as advisory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use libc::pid_t;

/// Reads the PID stored in `path`.  Returns `None` when the file is missing
/// or its contents do not parse as an integer; surrounding whitespace is
/// ignored.
pub fn read<P: AsRef<Path>>(path: P) -> Option<pid_t> {
    let contents = fs::read_to_string(path).ok()?;
    contents.trim().parse().ok()
}

/// Writes `pid` to `path`, replacing any previous contents.
pub fn write<P: AsRef<Path>>(path: P, pid: pid_t) -> io::Result<()> {
    fs::write(path, format!("{pid}\n"))
}

/// Removes `path`, ignoring every error.  Idempotent: removing a path that
/// does not exist is fine.
pub fn remove<P: AsRef<Path>>(path: P) {
    let _ = fs::remove_file(path);
}

/// Deletes a pid file when dropped, whatever path the owning function takes
/// out of scope.
pub struct RemoveOnDrop {
    path: PathBuf,
}

impl RemoveOnDrop {
    pub fn new<P: Into<PathBuf>>(path: P) -> RemoveOnDrop {
        RemoveOnDrop { path: path.into() }
    }
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        remove(&self.path);
    }
}
