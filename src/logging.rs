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

//! Per-process log output.
//!
//! Every role re-applies its logging configuration after fork, the way it
//! would re-read a log config in any other daemon stack.  The tracing
//! subscriber itself can only be installed once per process image and is
//! inherited across fork, so the part that varies per process — where the
//! lines go — lives behind a writer that re-reads a process-local cell on
//! every event.  A forked child that calls [`apply`] swaps in its own file
//! without touching the inherited subscriber.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

/// Where a process logs to and how verbosely.
///
/// With no `filename` the lines go to stderr — which, after daemonization,
/// is whatever file the standard streams were redirected into.  The level of
/// the first configuration applied in a process tree wins; forked children
/// can redirect their output but not raise the inherited level.
#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub filename: Option<PathBuf>,
    pub level: Option<String>,
}

static OUTPUT: Mutex<Option<File>> = Mutex::new(None);

struct ProcessWriter;

impl<'a> MakeWriter<'a> for ProcessWriter {
    type Writer = Box<dyn Write>;

    fn make_writer(&'a self) -> Self::Writer {
        let output = OUTPUT.lock().unwrap();
        match output.as_ref().and_then(|file| file.try_clone().ok()) {
            Some(file) => Box::new(file),
            None => Box::new(io::stderr()),
        }
    }
}

/// Applies `config` to the current process: points log output at the
/// configured file (append mode) and installs the subscriber if this process
/// image has not done so yet.
pub fn apply(config: &LogConfig) {
    if let Some(ref filename) = config.filename {
        match OpenOptions::new().append(true).create(true).open(filename) {
            Ok(file) => *OUTPUT.lock().unwrap() = Some(file),
            Err(error) => {
                eprintln!("{}: could not open log file ({error})", filename.display())
            }
        }
    }

    let level = config
        .level
        .as_deref()
        .and_then(|level| level.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .with_writer(ProcessWriter)
        .try_init();
}
