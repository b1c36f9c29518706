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

//! Multiplicative hashing for the string hash table and the index hash
//! table (§3). Both tables are plain arrays of bucket-head offsets sized
//! as a percentage of the segment; entries chain through a field inside
//! the heap object itself, so the only thing this module owns is turning
//! bytes into a bucket index.

const HASH_MULTIPLIER: u64 = 0x9E3779B97F4A7C15; // golden-ratio constant, odd

/// Multiplicative hash over a single byte slice.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut h: u64 = 14695981039346656037; // FNV offset basis, arbitrary seed
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(HASH_MULTIPLIER);
    }
    h
}

/// Two-part hash over a long string's payload and its optional secondary
/// string (language tag / xsd type / uri prefix), folding in the value's
/// type tag and byte length so that interning never collapses two values
/// of different encoded types that happen to share bytes.
pub fn long_string_hash(payload: &[u8], secondary: Option<&[u8]>, value_type: u8) -> u64 {
    let mut h = hash_bytes(payload);
    h = h.wrapping_mul(HASH_MULTIPLIER) ^ (payload.len() as u64);
    if let Some(sec) = secondary {
        h ^= hash_bytes(sec).wrapping_mul(HASH_MULTIPLIER);
    }
    h ^ (value_type as u64)
}

/// Reduces a hash to a bucket index for a table of `bucket_count` slots.
/// `bucket_count` need not be a power of two; the table size is chosen as
/// a percentage of segment size, not rounded.
#[inline]
pub fn bucket_index(hash: u64, bucket_count: usize) -> usize {
    if bucket_count == 0 {
        0
    } else {
        (hash % bucket_count as u64) as usize
    }
}
