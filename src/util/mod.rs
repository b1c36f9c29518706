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

pub mod hash;

/// Rounds `n` up to the next multiple of 8, the allocator's fixed
/// alignment (§4.C).
#[inline]
pub fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Words-to-bytes and back; the segment speaks offsets in bytes but most
/// allocator arithmetic is phrased in machine words.
pub const WORD_SIZE: usize = std::mem::size_of::<i64>();

#[inline]
pub fn words_to_bytes(words: usize) -> usize {
    words * WORD_SIZE
}

#[inline]
pub fn bytes_to_words(bytes: usize) -> usize {
    (bytes + WORD_SIZE - 1) / WORD_SIZE
}

#[cfg(test)]
mod test_util {
    use super::*;

    #[test]
    fn test_align8() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(9), 16);
    }

    #[test]
    fn test_words_bytes_roundtrip() {
        assert_eq!(bytes_to_words(words_to_bytes(7)), 7);
    }
}
