// Copyright 2019 Fullstop000 <fullstop1005@gmail.com>.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

//! Write-ahead journal (§4.I): an append-only file of [`Entry`] records,
//! opened once per process and written to before every mutation the core
//! performs. `record`/`db` never touch the segment until the matching
//! journal write has returned and flushed (§4.I "Writing order");
//! [`replay`] rebuilds an equivalent segment from the file alone.
//!
//! The file path is a build-time constant (§5 "Environment"), not
//! something callers configure per-attach — matching the source, which
//! hardcodes `WG_JOURNAL_FILENAME`.

pub mod entry;
pub mod replay;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{DbError, Result, Status};

pub use entry::{Entry, Payload, ValueType};
pub use replay::{replay, TranslationTable};

pub const MAGIC: &[u8; 4] = b"wgdb";

/// Default journal location (§5). Real deployments will usually want a
/// path next to the segment instead; [`Journal::open`] takes one
/// explicitly for that reason, with this constant only as the fallback a
/// CLI with no `-l` override uses.
pub fn default_path() -> PathBuf {
    PathBuf::from("/tmp/wgdb.journal")
}

fn journal_err(msg: impl Into<String>) -> DbError {
    DbError::new(Status::JournalFailure, Some(&msg.into()))
}

/// A live handle on the journal file. Every logging call appends one
/// [`Entry`] and flushes before returning, so a crash never leaves a
/// half-written entry followed by more data (§4.I "first journal entry
/// is written and flushed; only then is the shared segment mutated").
pub struct Journal {
    file: File,
}

impl Journal {
    /// Opens (creating if absent) the journal at `path`. A fresh file
    /// gets the magic header written immediately; an existing one has
    /// its header validated before any entry is appended.
    pub fn open(path: &Path) -> Result<Journal> {
        let is_new = !path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(|e| journal_err(format!("error opening log file: {}", e)))?;
        if is_new {
            file.write_all(MAGIC)
                .map_err(|e| journal_err(format!("error initializing log file: {}", e)))?;
            file.flush()
                .map_err(|e| journal_err(format!("error flushing log file: {}", e)))?;
            debug!("journal: created {}", path.display());
        } else {
            check_magic(&mut file)?;
            debug!("journal: reopened {}", path.display());
        }
        Ok(Journal { file })
    }

    fn append(&mut self, e: &Entry) -> Result<()> {
        e.write(&mut self.file)
            .map_err(|err| journal_err(format!("error writing to log file: {}", err)))?;
        self.file
            .flush()
            .map_err(|err| journal_err(format!("error flushing log file: {}", err)))?;
        debug!("journal: appended {:?}", e);
        Ok(())
    }

    pub fn log_create(&mut self, length: i64, offset: i64) -> Result<()> {
        self.append(&Entry::Create { length, offset })
    }

    pub fn log_delete(&mut self, offset: i64) -> Result<()> {
        self.append(&Entry::Delete { offset })
    }

    pub fn log_encode(&mut self, vtype: ValueType, payload: Payload, result: i64) -> Result<()> {
        self.append(&Entry::Encode { vtype, payload, result })
    }

    pub fn log_set(&mut self, offset: i64, column: i64, value: i64) -> Result<()> {
        self.append(&Entry::Set { offset, column, value })
    }
}

/// Validates the 4-byte magic at the start of an existing journal file,
/// leaving the cursor at end-of-file afterward so the next `append` call
/// lands after it (mirrors opening in append mode, which always writes
/// at the end regardless of where reads left the cursor).
fn check_magic(file: &mut File) -> Result<()> {
    file.seek(SeekFrom::Start(0))
        .map_err(|e| journal_err(format!("error checking log file: {}", e)))?;
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)
        .map_err(|_| journal_err("error checking log file"))?;
    if &buf != MAGIC {
        return Err(journal_err("bad log file magic"));
    }
    file.seek(SeekFrom::End(0))
        .map_err(|e| journal_err(format!("error checking log file: {}", e)))?;
    Ok(())
}

/// Opens `path` read-only and validates its magic header, for callers
/// (like `replay`) that only ever read the file.
pub fn open_for_replay(path: &Path) -> Result<File> {
    let mut file = File::open(path)
        .map_err(|e| journal_err(format!("error opening log file: {}", e)))?;
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)
        .map_err(|_| journal_err("error checking log file"))?;
    if &buf != MAGIC {
        return Err(journal_err("bad log file magic"));
    }
    Ok(file)
}
