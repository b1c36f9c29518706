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

//! The T-tree / hash indexing subsystems are deliberately out of scope
//! (§1): the core only ever notifies an index collaborator of the
//! create/remove/reindex events it must react to, through the index
//! hash headers it maintains in the segment (`SegmentHeader::indexhash_area`,
//! `indexhdr_area`). This module defines that notification boundary as a
//! trait so `record` can call it without knowing whether anything real is
//! listening.
//!
//! `createindex`/`createhash`/`dropindex`/`listindex` (§6) are CLI-level
//! commands a real index implementation would expose; they have no core
//! counterpart here.

use crate::error::Result;
use crate::mem::segment::Segment;

/// Column position within a record, as passed to `set_field`.
pub type Column = usize;

/// Notified by `record` operations (§4.G) so that indexes stay consistent
/// with the record store. `NullIndex` is the default: it satisfies the
/// trait by doing nothing, matching a segment with no indexes registered.
pub trait IndexCollaborator {
    /// A record was created with every field NULL; called once per field.
    fn on_create(&self, seg: &Segment, rec: usize, col: Column) -> Result<()>;

    /// `rec`'s field `col` is about to change from `old` to `new`; called
    /// before the word is written so the collaborator can remove the old
    /// entry. `old`/`new` are encoded words, not decoded values, since an
    /// index only needs to compare/hash them.
    fn on_remove(&self, seg: &Segment, rec: usize, col: Column, old: i64) -> Result<()>;

    /// The field write completed; called after so the collaborator can
    /// insert the new entry.
    fn on_insert(&self, seg: &Segment, rec: usize, col: Column, new: i64) -> Result<()>;

    /// `rec` is about to be freed; called once per field before the
    /// record object itself is returned to its area.
    fn on_delete(&self, seg: &Segment, rec: usize, col: Column, value: i64) -> Result<()>;

    /// `rec`'s comparison value changed transitively (its field was
    /// re-indexed) because a backlinked descendant's field changed;
    /// called while walking ancestors in `set_field`'s re-index step.
    fn on_reindex_ancestor(&self, seg: &Segment, rec: usize, col: Column) -> Result<()>;
}

/// The collaborator used when no index subsystem is registered: every
/// hook is a no-op, so `record` operations behave exactly as if indexing
/// did not exist.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIndex;

impl IndexCollaborator for NullIndex {
    fn on_create(&self, _seg: &Segment, _rec: usize, _col: Column) -> Result<()> {
        Ok(())
    }

    fn on_remove(&self, _seg: &Segment, _rec: usize, _col: Column, _old: i64) -> Result<()> {
        Ok(())
    }

    fn on_insert(&self, _seg: &Segment, _rec: usize, _col: Column, _new: i64) -> Result<()> {
        Ok(())
    }

    fn on_delete(&self, _seg: &Segment, _rec: usize, _col: Column, _value: i64) -> Result<()> {
        Ok(())
    }

    fn on_reindex_ancestor(&self, _seg: &Segment, _rec: usize, _col: Column) -> Result<()> {
        Ok(())
    }
}

/// Re-indexing after `set_field` walks backlinked ancestors up to this
/// many hops (§9: "The backward recursion depth for re-indexing after
/// `set_field` is bounded by a compile-time constant"). A backlink graph
/// with a cycle longer than this bound can leave stale index entries;
/// that is observable, underspecified behavior the source exhibits too,
/// not a bug to paper over.
pub const REINDEX_MAX_DEPTH: usize = 6;

#[cfg(test)]
mod test_index {
    use super::*;
    use crate::mem::segment::Segment;

    #[test]
    fn test_null_index_always_succeeds() {
        let seg = Segment::attach_local(64 * 1024).unwrap();
        let idx = NullIndex;
        idx.on_create(&seg, 100, 0).unwrap();
        idx.on_remove(&seg, 100, 0, 42).unwrap();
        idx.on_insert(&seg, 100, 0, 43).unwrap();
        idx.on_delete(&seg, 100, 0, 43).unwrap();
        idx.on_reindex_ancestor(&seg, 100, 0).unwrap();
    }
}
