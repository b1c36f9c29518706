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

//! Knobs for opening a database (§6 "Attach key", "Permissions";
//! §4.B attach/create). Kept as a plain builder rather than threaded
//! through every call, mirroring how the source's CLI collects them once
//! at startup and never revisits them per-operation.

use std::path::PathBuf;

use crate::lock::Protocol;
use crate::mem::segment::DEFAULT_SUBAREA_SIZE;

/// Minimum segment size accepted by [`attach`][crate::db::Database::attach]:
/// small enough for tests, large enough to hold a header plus one
/// sub-area of each kind.
pub const MIN_SEGMENT_SIZE: usize = DEFAULT_SUBAREA_SIZE * 16;

/// A textual attach key, normalized the way §6 describes: non-positive
/// or extremal values fall back to a fixed default rather than erroring,
/// since the CLI accepts whatever the user typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachKey(pub i64);

impl AttachKey {
    pub fn parse(text: &str) -> AttachKey {
        AttachKey(text.parse().unwrap_or(0))
    }

    pub fn normalized(self) -> i64 {
        crate::mem::segment::normalize_key(self.0)
    }
}

impl Default for AttachKey {
    fn default() -> Self {
        AttachKey(0)
    }
}

/// How a process wants to attach to (or create) a segment.
#[derive(Debug, Clone)]
pub struct DbOptions {
    /// Shared-memory key; ignored by [`Database::open_local`][crate::db::Database::open_local].
    pub key: AttachKey,
    /// Size requested when creating a new segment.
    pub size: usize,
    /// Smallest size `attach` will settle for if `size` can't be granted.
    pub min_size: usize,
    /// Whether this process may create the segment if it doesn't exist.
    pub create: bool,
    /// Octal permission mode for a newly created segment; normalized by
    /// [`normalize_mode`][crate::mem::segment::normalize_mode].
    pub mode: u32,
    /// Which RW-lock protocol a freshly created segment uses. Ignored
    /// when attaching to an existing one — its header already decided.
    pub lock_protocol: Protocol,
    /// Whether mutations are journaled. A segment opened with this
    /// `false` never opens the journal file at all.
    pub logging: bool,
    /// Journal file path, when `logging` is set.
    pub journal_path: PathBuf,
}

impl Default for DbOptions {
    fn default() -> Self {
        DbOptions {
            key: AttachKey::default(),
            size: MIN_SEGMENT_SIZE,
            min_size: MIN_SEGMENT_SIZE,
            create: true,
            mode: 0o660,
            lock_protocol: Protocol::default(),
            logging: false,
            journal_path: crate::journal::default_path(),
        }
    }
}

impl DbOptions {
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self.min_size = self.min_size.min(size);
        self
    }

    pub fn with_key(mut self, key: AttachKey) -> Self {
        self.key = key;
        self
    }

    pub fn with_logging(mut self, logging: bool) -> Self {
        self.logging = logging;
        self
    }

    pub fn with_journal_path(mut self, path: PathBuf) -> Self {
        self.journal_path = path;
        self
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = crate::mem::segment::normalize_mode(mode);
        self
    }

    pub fn with_lock_protocol(mut self, protocol: Protocol) -> Self {
        self.lock_protocol = protocol;
        self
    }
}

#[cfg(test)]
mod test_options {
    use super::*;

    #[test]
    fn test_default_options_create_small_local_segment() {
        let opts = DbOptions::default();
        assert!(opts.create);
        assert!(!opts.logging);
        assert_eq!(opts.size, MIN_SEGMENT_SIZE);
    }

    #[test]
    fn test_attach_key_parses_decimal() {
        assert_eq!(AttachKey::parse("42").0, 42);
        assert_eq!(AttachKey::parse("not a number").0, 0);
    }

    #[test]
    fn test_with_size_lowers_min_size_to_match() {
        let opts = DbOptions::default().with_size(1024);
        assert_eq!(opts.min_size, 1024);
    }
}
