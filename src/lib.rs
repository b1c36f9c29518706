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

#![allow(clippy::unreadable_literal)]
#![allow(clippy::type_complexity)]
// See https://github.com/rust-lang/rust-clippy/issues/1608
#![allow(clippy::redundant_closure)]

extern crate libc;
#[macro_use]
extern crate log;
extern crate crc;

pub mod db;
pub mod dump;
pub mod encoding;
pub mod error;
pub mod features;
pub mod index;
pub mod journal;
pub mod lock;
pub mod mem;
pub mod options;
pub mod record;
mod util;

pub use db::Database;
pub use error::{DbError, Result, Status};
pub use features::Features;
pub use index::{IndexCollaborator, NullIndex};
pub use options::{AttachKey, DbOptions};
