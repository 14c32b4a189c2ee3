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

//! Redirection of the standard streams into files.
//!
//! stdout and stderr targets are opened in append mode (created if absent);
//! when both name the same path they share one descriptor.  stdin is always
//! the null device.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use thiserror::Error;

use crate::sys;

const NULL_DEVICE: &str = "/dev/null";

/// Which stream could not be opened.  Files opened before the failure are
/// closed again on the way out.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("could not open the stdout target: {0}")]
    Stdout(io::Error),
    #[error("could not open the stderr target: {0}")]
    Stderr(io::Error),
    #[error("could not open the null device: {0}")]
    Stdin(io::Error),
}

/// The three files a daemonized process talks to instead of the terminal.
#[derive(Debug)]
pub struct RedirectTargets {
    out: File,
    /// `None` when stderr shares the stdout descriptor.
    err: Option<File>,
    input: File,
}

impl RedirectTargets {
    /// Opens the redirection targets.  `None` paths fall back to the null
    /// device.
    pub fn open(stdout: Option<&Path>, stderr: Option<&Path>) -> Result<RedirectTargets, OpenError> {
        let stdout = stdout.unwrap_or_else(|| Path::new(NULL_DEVICE));
        let stderr = stderr.unwrap_or_else(|| Path::new(NULL_DEVICE));

        let out = append_to(stdout).map_err(OpenError::Stdout)?;
        let err = if stdout == stderr {
            None
        } else {
            Some(append_to(stderr).map_err(OpenError::Stderr)?)
        };
        let input = File::open(NULL_DEVICE).map_err(OpenError::Stdin)?;
        Ok(RedirectTargets { out, err, input })
    }

    /// Replaces fds 0, 1 and 2 with the opened targets and closes the
    /// originals.
    pub fn apply(self) -> io::Result<()> {
        sys::dup2(self.input.as_raw_fd(), 0)?;
        sys::dup2(self.out.as_raw_fd(), 1)?;
        let err_fd = match &self.err {
            Some(err) => err.as_raw_fd(),
            None => self.out.as_raw_fd(),
        };
        sys::dup2(err_fd, 2)?;
        Ok(())
        // self drops here, closing the original descriptors.
    }
}

fn append_to(path: &Path) -> io::Result<File> {
    OpenOptions::new().append(true).create(true).open(path)
}
