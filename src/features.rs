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

use bitflags::bitflags;

bitflags! {
    /// Published in the segment header and in every dump. `attach` rejects
    /// a segment whose mask differs from the bitmask the attaching process
    /// was built with: these bits pin down layout decisions that are not
    /// otherwise observable from the header alone (e.g. which lock
    /// protocol the segment's lock words are formatted for).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u32 {
        /// Encoded values use the full 64-bit tagged-word layout rather
        /// than a 32-bit one.
        const WORD64        = 0b0000_0001;
        /// The task-fair queued lock protocol is in effect for this
        /// segment (mutually exclusive with the two spinlock protocols,
        /// but represented as a bit so mismatches are caught by a simple
        /// mask comparison).
        const QUEUED_LOCKS  = 0b0000_0010;
        /// T-tree index nodes use the chained (as opposed to flat) layout.
        const CHAINED_TTREE = 0b0000_0100;
        /// Backlink chains are maintained for record-reference fields.
        const BACKLINKS     = 0b0000_1000;
        /// Child database (external reference) table is present.
        const CHILD_DBS     = 0b0001_0000;
        /// Index templates (multi-column index descriptors) are enabled.
        const INDEX_TEMPLATES = 0b0010_0000;
    }
}

impl Default for Features {
    fn default() -> Self {
        Features::WORD64 | Features::BACKLINKS
    }
}

#[cfg(test)]
mod test_features {
    use super::*;

    #[test]
    fn test_default_has_backlinks_and_word64() {
        let f = Features::default();
        assert!(f.contains(Features::WORD64));
        assert!(f.contains(Features::BACKLINKS));
        assert!(!f.contains(Features::QUEUED_LOCKS));
    }

    #[test]
    fn test_mismatch_detection() {
        let a = Features::WORD64 | Features::BACKLINKS;
        let b = Features::WORD64 | Features::QUEUED_LOCKS;
        assert_ne!(a, b);
    }
}
