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

//! The segment: attach/detach lifecycle, sub-area carving, and the two
//! allocator styles that carve records, strings, and index storage out
//! of it (§3, §4.B-4.E).

pub mod atomic;
pub mod fixed;
pub mod objhdr;
pub mod segment;
pub mod shm;
pub mod subarea;
pub mod varlen;

pub use segment::Segment;
