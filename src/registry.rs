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

//! The entry registry: `"module:symbol"` identifiers mapped to callables.
//!
//! Daemons and workers name the code they run with a string so that launch
//! requests can travel through pid files, configs and command lines.  The
//! identifiers resolve against a process-global map populated by
//! [`register`] at program start — entries are plain function pointers, so
//! the map survives fork and resolution works identically in every role.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use lazy_static::lazy_static;
use thiserror::Error;
use tracing::{event, Level};

use crate::context;

/// The opaque argument map handed to an entry.
pub type EntryArgs = serde_json::Map<String, serde_json::Value>;

/// A registered entry point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Entry {
    /// The code the daemon or worker runs.
    pub run: fn(&EntryContext) -> anyhow::Result<()>,
    /// Called when `run` fails, before the process exits non-zero.  Its own
    /// failures are logged and ignored.
    pub on_error: Option<fn(&EntryContext, &anyhow::Error) -> anyhow::Result<()>>,
}

impl Entry {
    pub fn new(run: fn(&EntryContext) -> anyhow::Result<()>) -> Entry {
        Entry { run, on_error: None }
    }

    pub fn with_error_hook(
        run: fn(&EntryContext) -> anyhow::Result<()>,
        on_error: fn(&EntryContext, &anyhow::Error) -> anyhow::Result<()>,
    ) -> Entry {
        Entry {
            run,
            on_error: Some(on_error),
        }
    }
}

/// What an entry gets to see while it runs: its argument map and the
/// cooperative-quit protocol.
pub struct EntryContext<'a> {
    pub args: &'a EntryArgs,
    quit: fn() -> bool,
}

impl<'a> EntryContext<'a> {
    pub(crate) fn new(args: &'a EntryArgs, quit: fn() -> bool) -> EntryContext<'a> {
        EntryContext { args, quit }
    }

    /// Entries should poll this and return as soon as it turns true.
    pub fn quit_requested(&self) -> bool {
        (self.quit)()
    }

    /// Sleeps for `duration`, returning early once a quit is requested.
    pub fn sleep(&self, duration: Duration) {
        context::sleep_while(duration, || !(self.quit)());
    }

    /// Convenience accessor for string-valued arguments.
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key)?.as_str()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("entry identifier {0:?} is not of the form \"module:symbol\"")]
    Malformed(String),
    #[error("no entry registered under {0:?}")]
    NotFound(String),
}

lazy_static! {
    static ref ENTRIES: RwLock<HashMap<String, Entry>> = RwLock::new(HashMap::new());
}

/// Splits an entry identifier into its module and symbol halves.
pub fn split_identifier(identifier: &str) -> Result<(&str, &str), ResolveError> {
    match identifier.split_once(':') {
        Some((module, symbol)) if !module.is_empty() && !symbol.is_empty() => Ok((module, symbol)),
        _ => Err(ResolveError::Malformed(identifier.to_string())),
    }
}

/// Registers `entry` under `identifier`, replacing any previous entry with
/// the same identifier.
pub fn register(identifier: &str, entry: Entry) {
    ENTRIES
        .write()
        .unwrap()
        .insert(identifier.to_string(), entry);
}

/// Looks up the entry registered under `identifier`.
pub fn resolve(identifier: &str) -> Result<Entry, ResolveError> {
    split_identifier(identifier)?;
    ENTRIES
        .read()
        .unwrap()
        .get(identifier)
        .copied()
        .ok_or_else(|| ResolveError::NotFound(identifier.to_string()))
}

/// Runs the entry's error hook, if any, swallowing its failures.
pub(crate) fn run_error_hook(entry: &Entry, ctx: &EntryContext, error: &anyhow::Error) {
    if let Some(on_error) = entry.on_error {
        if let Err(hook_error) = on_error(ctx, error) {
            event!(
                Level::WARN,
                "the error hook failed and was ignored ({hook_error:#})"
            );
        }
    }
}
