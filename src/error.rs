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

use std::fmt;

/// Coarse classification of every error the core can return.
///
/// Allocation failures are recoverable by the caller; index and backlink
/// corruption are fatal; journal failures before a mutation are non-fatal,
/// but a failure mid-mutation must be reported as [`Status::Inconsistent`]
/// so the caller detaches instead of continuing.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Status {
    /// Segment handle is stale, null, or was never attached.
    InvalidHandle,
    /// The relevant allocator area is exhausted and could not grow.
    OutOfMemory,
    /// Negative length, out-of-range column, or a value of the wrong
    /// encoding for the operation.
    BadArgument,
    /// An indexed operation observed a state the index collaborator
    /// rejected.
    IndexConflict,
    /// `delete_record` was called on a record with a non-empty backlink
    /// chain, or a backlink chain was found to be corrupt.
    BacklinkViolation,
    /// An encoded value referenced an external database that is not
    /// registered in this segment.
    UnknownExternal,
    /// The journal could not be opened, written, or flushed.
    JournalFailure,
    /// `update_atomic_field` observed a value other than `expected`.
    CasFailure,
    /// `set_atomic_field` / `add_int_atomic_field` exhausted their retry
    /// budget.
    RetryExhausted,
    /// A task-fair queued lock acquisition exceeded its caller-supplied
    /// timeout.
    LockTimeout,
    /// A mutation's journal entry was written but the segment update that
    /// should have followed it did not complete; the segment must be
    /// treated as inconsistent and detached.
    Inconsistent,
    /// A dump or journal file failed header, checksum, or version
    /// validation.
    Corruption,
    /// The operating-system shared memory primitive failed (create, map,
    /// unmap, or destroy).
    SystemError,
    /// The requested segment already exists, or was requested to be
    /// created without permission to do so.
    Conflict,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::InvalidHandle => "invalid handle",
            Status::OutOfMemory => "out of memory",
            Status::BadArgument => "bad argument",
            Status::IndexConflict => "index conflict",
            Status::BacklinkViolation => "backlink invariant violated",
            Status::UnknownExternal => "external reference not recognized",
            Status::JournalFailure => "journal failure",
            Status::CasFailure => "CAS precondition failed",
            Status::RetryExhausted => "retry budget exhausted",
            Status::LockTimeout => "lock acquisition timed out",
            Status::Inconsistent => "segment left in an inconsistent state",
            Status::Corruption => "corruption",
            Status::SystemError => "system error",
            Status::Conflict => "conflict",
        };
        write!(f, "{}", s)
    }
}

/// An error carrying a [`Status`] and an optional human-readable
/// description, mirroring the shape every core entry point returns.
#[derive(Debug, Clone)]
pub struct DbError {
    status: Status,
    description: Option<String>,
}

impl DbError {
    pub fn new(status: Status, description: Option<&str>) -> Self {
        DbError {
            status,
            description: description.map(str::to_owned),
        }
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    pub fn description(&self) -> &str {
        self.description
            .as_deref()
            .unwrap_or_else(|| self.default_description())
    }

    fn default_description(&self) -> &'static str {
        match self.status {
            Status::InvalidHandle => "invalid handle",
            Status::OutOfMemory => "out of memory",
            Status::BadArgument => "bad argument",
            Status::IndexConflict => "index conflict",
            Status::BacklinkViolation => "backlink invariant violated",
            Status::UnknownExternal => "external reference not recognized",
            Status::JournalFailure => "journal failure",
            Status::CasFailure => "CAS precondition failed",
            Status::RetryExhausted => "retry budget exhausted",
            Status::LockTimeout => "lock acquisition timed out",
            Status::Inconsistent => "segment left in an inconsistent state",
            Status::Corruption => "corruption",
            Status::SystemError => "system error",
            Status::Conflict => "conflict",
        }
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.description())
    }
}

impl std::error::Error for DbError {}

impl From<std::io::Error> for DbError {
    fn from(e: std::io::Error) -> Self {
        DbError::new(Status::JournalFailure, Some(&e.to_string()))
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Maps a [`Status`] to the CLI exit code contract of §6: 0 success is
/// handled by the caller before reaching this function. Three tiers: 1 for
/// statuses a caller can recover from or retry past, 2 for statuses that
/// are fatal to the current operation but leave the segment intact, and 3
/// for `Inconsistent` alone, since that is specifically the "fatal after
/// partial mutation" tier.
pub fn exit_code(status: Status) -> i32 {
    match status {
        Status::Inconsistent => 3,
        Status::IndexConflict
        | Status::BacklinkViolation
        | Status::Corruption
        | Status::InvalidHandle
        | Status::SystemError
        | Status::JournalFailure => 2,
        Status::OutOfMemory
        | Status::BadArgument
        | Status::CasFailure
        | Status::RetryExhausted
        | Status::LockTimeout
        | Status::UnknownExternal
        | Status::Conflict => 1,
    }
}

#[cfg(test)]
mod test_error {
    use super::*;

    #[test]
    fn test_default_description() {
        let e = DbError::new(Status::OutOfMemory, None);
        assert_eq!(e.description(), "out of memory");
    }

    #[test]
    fn test_custom_description() {
        let e = DbError::new(Status::BadArgument, Some("column 12 out of range"));
        assert_eq!(e.description(), "column 12 out of range");
        assert_eq!(e.status(), Status::BadArgument);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(Status::Inconsistent), 3);
        assert_eq!(exit_code(Status::BacklinkViolation), 2);
        assert_eq!(exit_code(Status::SystemError), 2);
        assert_eq!(exit_code(Status::JournalFailure), 2);
        assert_eq!(exit_code(Status::InvalidHandle), 2);
        assert_eq!(exit_code(Status::BadArgument), 1);
        assert_eq!(exit_code(Status::RetryExhausted), 1);
    }
}
