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

//! Tagged-word value encoding (§4.F).
//!
//! ```text
//!  low bits   meaning
//!  …000       offset of a data record
//!  …001/…101  offset of a full-width integer (word area)
//!  …010       offset of a full-width double (doubleword area)
//!  …100       offset of a long string
//!  …110       offset of a short string
//!  xxx011     immediate small int, shifted 3
//!  00001111   immediate fixed-point (×10000)
//!  00011111   immediate char
//!  00101111   immediate date (days since epoch)
//!  00111111   immediate time (centiseconds)
//!  01011111   immediate anonymous-constant index
//!  0111       immediate variable (reasoner)
//!  0 (word)   NULL
//! ```
//!
//! Everything below the `xxx011`/`0111` rows shares the low 3 bits `111`;
//! bit 3 then splits that space into the four-bit "variable" tag and the
//! eight-bit immediate family, and bits 4-7 of the latter pick the
//! concrete type. Heap tags never need masking beyond their own width
//! because every offset handed to `encode_*` is already 8-byte aligned,
//! so OR-ing in a tag can never collide with the address bits.

pub mod strtable;

use crate::error::{DbError, Result, Status};
use crate::mem::segment::Segment;
use crate::mem::fixed;
use crate::util::WORD_SIZE;

const TAG_RECORD: i64 = 0b000;
const TAG_INT: i64 = 0b001;
const TAG_DOUBLE: i64 = 0b010;
const TAG_LONGSTR: i64 = 0b100;
const TAG_SHORTSTR: i64 = 0b110;
const TAG_SMALLINT: i64 = 0b011;
const TAG_EXT: i64 = 0b111;

const EXT_VAR: i64 = 0b0111;
const EXT_FAMILY: i64 = 0b1111;

const SUBTAG_FIXPOINT: i64 = 0x0F;
const SUBTAG_CHAR: i64 = 0x1F;
const SUBTAG_DATE: i64 = 0x2F;
const SUBTAG_TIME: i64 = 0x3F;
const SUBTAG_ANONCONST: i64 = 0x5F;

/// Long-string "type" byte stored in the object's meta word, distinguishing
/// the four long-string-shaped domains that share one heap layout.
pub const LONGSTR_TYPE_STR: u8 = 0;
pub const LONGSTR_TYPE_URI: u8 = 1;
pub const LONGSTR_TYPE_XML: u8 = 2;
pub const LONGSTR_TYPE_BLOB: u8 = 3;

/// Smallest/largest value that still fits the 3-bit-shifted small-int
/// immediate.
const SMALLINT_MAX: i64 = i64::MAX >> 3;
const SMALLINT_MIN: i64 = i64::MIN >> 3;

/// A long-string-shaped value: raw payload bytes plus an optional
/// secondary string (language tag, xsd type, or URI prefix) and which of
/// the four domains it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongStrValue {
    pub kind: u8,
    pub payload: Vec<u8>,
    pub secondary: Option<Vec<u8>>,
}

/// The logical value a caller hands to `encode` or gets back from `decode`
/// for immediates and for values whose heap payload has already been
/// resolved. Heap-backed values that `decode` has not resolved are
/// represented as [`Decoded`] instead, since resolving them requires
/// reading the segment.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    SmallInt(i64),
    FullInt(i64),
    Double(f64),
    Fixpoint(f64),
    Char(u8),
    Date(i32),
    Time(i32),
    Var(i64),
    AnonConst(i64),
    ShortStr(Vec<u8>),
    LongStr(LongStrValue),
    RecordRef(usize),
}

/// The sum type §8's "Redesign-as-data-model" note asks for: a decoded
/// word with heap references left as offsets, not yet dereferenced into
/// their payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    Null,
    SmallInt(i64),
    Char(u8),
    Date(i32),
    Time(i32),
    Var(i64),
    AnonConst(i64),
    Fixpoint(i64),
    FullInt(usize),
    Double(usize),
    ShortStr(usize),
    LongStr(usize),
    RecordRef(usize),
}

/// Maximum short-string payload: the fixed-size short-string cell (32 B)
/// minus a one-byte length prefix.
pub const SHORTSTR_CELL_SIZE: usize = 32;
pub const SHORTSTR_MAX_PAYLOAD: usize = SHORTSTR_CELL_SIZE - 1;

fn bad(msg: &str) -> DbError {
    DbError::new(Status::BadArgument, Some(msg))
}

/// Decodes a raw word into its logical shape, leaving heap references as
/// offsets.
pub fn decode(word: i64) -> Decoded {
    if word == 0 {
        return Decoded::Null;
    }
    let low3 = word & 0b111;
    match low3 {
        TAG_RECORD => Decoded::RecordRef(word as usize),
        TAG_DOUBLE => Decoded::Double((word & !0b111) as usize),
        TAG_LONGSTR => Decoded::LongStr((word & !0b111) as usize),
        TAG_SHORTSTR => Decoded::ShortStr((word & !0b111) as usize),
        TAG_SMALLINT => Decoded::SmallInt(word >> 3),
        _ if low3 & 0b011 == TAG_INT => Decoded::FullInt((word & !0b011) as usize),
        TAG_EXT => decode_ext(word),
        _ => unreachable!("low3 exhausts every 3-bit pattern"),
    }
}

fn decode_ext(word: i64) -> Decoded {
    if word & 0b1111 == EXT_VAR {
        return Decoded::Var(word >> 4);
    }
    debug_assert_eq!(word & 0b1111, EXT_FAMILY);
    let subtag = word & 0xFF;
    let payload = word >> 8;
    match subtag {
        SUBTAG_FIXPOINT => Decoded::Fixpoint(payload),
        SUBTAG_CHAR => Decoded::Char((payload & 0xFF) as u8),
        SUBTAG_DATE => Decoded::Date(payload as i32),
        SUBTAG_TIME => Decoded::Time(payload as i32),
        SUBTAG_ANONCONST => Decoded::AnonConst(payload),
        _ => unreachable!("no other 8-bit immediate family tags are issued"),
    }
}

#[inline]
pub fn encode_null() -> i64 {
    0
}

/// Encodes a small integer as an immediate if it fits in 61 bits,
/// otherwise `None` so the caller falls back to [`encode_full_int`].
pub fn encode_small_int(value: i64) -> Option<i64> {
    if value >= SMALLINT_MIN && value <= SMALLINT_MAX {
        Some((value << 3) | TAG_SMALLINT)
    } else {
        None
    }
}

pub fn encode_char(value: u8) -> i64 {
    ((value as i64) << 8) | SUBTAG_CHAR
}

pub fn encode_date(days_since_epoch: i32) -> i64 {
    ((days_since_epoch as i64) << 8) | SUBTAG_DATE
}

pub fn encode_time(centiseconds: i32) -> i64 {
    ((centiseconds as i64) << 8) | SUBTAG_TIME
}

pub fn encode_fixpoint(value: f64) -> i64 {
    let scaled = (value * 10_000.0).round() as i64;
    (scaled << 8) | SUBTAG_FIXPOINT
}

pub fn decode_fixpoint(scaled: i64) -> f64 {
    scaled as f64 / 10_000.0
}

pub fn encode_var(slot: i64) -> i64 {
    (slot << 4) | EXT_VAR
}

pub fn encode_anon_const(index: i64) -> i64 {
    (index << 8) | SUBTAG_ANONCONST
}

/// Allocates a full-width integer cell from the word area and returns its
/// tagged offset.
pub fn encode_full_int(seg: &Segment, value: i64) -> Result<i64> {
    let area = &seg.header().word_area;
    let offset = fixed::alloc(seg, area)?;
    unsafe { crate::mem::atomic::store(seg.base(), offset, value) };
    Ok(offset as i64 | TAG_INT)
}

pub fn decode_full_int(seg: &Segment, offset: usize) -> i64 {
    unsafe { crate::mem::atomic::load(seg.base(), offset) }
}

pub fn free_full_int(seg: &Segment, offset: usize) {
    fixed::free(seg, &seg.header().word_area, offset);
}

/// Allocates a full-width double from the doubleword area and returns its
/// tagged offset. The double's raw bits, not its numeric value, are
/// stored, so encode/decode round-trip bit-for-bit including NaNs.
pub fn encode_double(seg: &Segment, value: f64) -> Result<i64> {
    let area = &seg.header().doubleword_area;
    let offset = fixed::alloc(seg, area)?;
    unsafe { crate::mem::atomic::store(seg.base(), offset, value.to_bits() as i64) };
    Ok(offset as i64 | TAG_DOUBLE)
}

pub fn decode_double(seg: &Segment, offset: usize) -> f64 {
    let bits = unsafe { crate::mem::atomic::load(seg.base(), offset) };
    f64::from_bits(bits as u64)
}

pub fn free_double(seg: &Segment, offset: usize) {
    fixed::free(seg, &seg.header().doubleword_area, offset);
}

/// Allocates a short string: a fixed 32-byte cell holding a one-byte
/// length prefix followed by up to 31 bytes of payload (§3 fixed-length
/// areas, cell size 32).
pub fn encode_short_str(seg: &Segment, payload: &[u8]) -> Result<i64> {
    if payload.len() > SHORTSTR_MAX_PAYLOAD {
        return Err(bad("short string payload exceeds 31 bytes"));
    }
    let area = &seg.header().shortstr_area;
    let offset = fixed::alloc(seg, area)?;
    let bytes = seg.bytes_mut();
    bytes[offset] = payload.len() as u8;
    bytes[offset + 1..offset + 1 + payload.len()].copy_from_slice(payload);
    Ok(offset as i64 | TAG_SHORTSTR)
}

pub fn decode_short_str(seg: &Segment, offset: usize) -> Vec<u8> {
    let bytes = seg.bytes();
    let len = bytes[offset] as usize;
    bytes[offset + 1..offset + 1 + len].to_vec()
}

pub fn free_short_str(seg: &Segment, offset: usize) {
    fixed::free(seg, &seg.header().shortstr_area, offset);
}

/// Encodes a record reference: the record's own offset, already
/// 8-aligned, needs no tag bits set.
pub fn encode_record_ref(offset: usize) -> i64 {
    debug_assert_eq!(offset & 0b111, 0, "record offsets are always 8-aligned");
    offset as i64
}

/// Allocates (or, if `intern` is set, reuses) a long string and returns
/// its tagged offset. `intern` implements §4.F's hash-consing rule;
/// callers that disable it get a fresh object every time, matching the
/// "uniqueness disabled" escape hatch the spec carves out for values that
/// must compare by byte content rather than shared identity.
pub fn encode_long_str(
    seg: &Segment,
    kind: u8,
    payload: &[u8],
    secondary: Option<&[u8]>,
    intern: bool,
) -> Result<i64> {
    let offset = if intern {
        strtable::intern(seg, kind, payload, secondary)?
    } else {
        strtable::create(seg, kind, payload, secondary)?
    };
    Ok(offset as i64 | TAG_LONGSTR)
}

pub fn decode_long_str(seg: &Segment, offset: usize) -> LongStrValue {
    strtable::read(seg, offset)
}

/// Compares two decoded values for the query/match layer, falling back to
/// byte comparison for long strings whose offsets differ (covers both
/// truly-unequal values and values that were allocated with interning
/// disabled, per §4.F).
pub fn values_equal(seg: &Segment, a: Decoded, b: Decoded) -> bool {
    match (a, b) {
        (Decoded::LongStr(oa), Decoded::LongStr(ob)) => {
            oa == ob || strtable::read(seg, oa) == strtable::read(seg, ob)
        }
        _ => a == b,
    }
}

pub fn is_heap_reference(word: i64) -> bool {
    !matches!(
        decode(word),
        Decoded::Null
            | Decoded::SmallInt(_)
            | Decoded::Char(_)
            | Decoded::Date(_)
            | Decoded::Time(_)
            | Decoded::Var(_)
            | Decoded::AnonConst(_)
            | Decoded::Fixpoint(_)
    )
}

/// Frees whatever heap object `word` references, if any. Callers are
/// responsible for refcount/backlink bookkeeping first (§4.F "Refcount
/// discipline"); this only reclaims storage once a value is known to have
/// zero remaining references.
pub fn free_heap_value(seg: &Segment, word: i64) {
    match decode(word) {
        Decoded::FullInt(off) => free_full_int(seg, off),
        Decoded::Double(off) => free_double(seg, off),
        Decoded::ShortStr(off) => free_short_str(seg, off),
        Decoded::LongStr(off) => strtable::release(seg, off),
        _ => {}
    }
}

/// Re-tags an offset as the same heap-reference kind a word was decoded
/// from. Journal replay (§4.I) needs this: once a translation table maps
/// an old offset to the fresh one a re-run allocation produced, the
/// encoded word has to be rebuilt from that new offset without repeating
/// the allocation.
pub fn retag(decoded: Decoded) -> i64 {
    match decoded {
        Decoded::Null => encode_null(),
        Decoded::SmallInt(v) => encode_small_int(v)
            .expect("value decoded as SmallInt always re-encodes as one"),
        Decoded::Char(c) => encode_char(c),
        Decoded::Date(d) => encode_date(d),
        Decoded::Time(t) => encode_time(t),
        Decoded::Var(v) => encode_var(v),
        Decoded::AnonConst(v) => encode_anon_const(v),
        Decoded::Fixpoint(scaled) => (scaled << 8) | SUBTAG_FIXPOINT,
        Decoded::FullInt(off) => off as i64 | TAG_INT,
        Decoded::Double(off) => off as i64 | TAG_DOUBLE,
        Decoded::ShortStr(off) => off as i64 | TAG_SHORTSTR,
        Decoded::LongStr(off) => off as i64 | TAG_LONGSTR,
        Decoded::RecordRef(off) => encode_record_ref(off),
    }
}

/// Picks the short-string cell for a plain string with no secondary that
/// fits its 31-byte payload limit, and the long-string area otherwise
/// (§4.F; mirrors the source's `wg_encode_unistr`, which folds the same
/// decision into one entry point so URI/XML/blob values and tagged or
/// oversized strings always go to the long-string area). Journal replay
/// calls this same function so it reproduces whichever tier the original
/// encode used.
pub fn encode_unistr(
    seg: &Segment,
    kind: u8,
    payload: &[u8],
    secondary: Option<&[u8]>,
    intern: bool,
) -> Result<i64> {
    if kind == LONGSTR_TYPE_STR && secondary.is_none() && payload.len() <= SHORTSTR_MAX_PAYLOAD {
        encode_short_str(seg, payload)
    } else {
        encode_long_str(seg, kind, payload, secondary, intern)
    }
}

pub const WORD_BYTES: usize = WORD_SIZE;

#[cfg(test)]
mod test_encoding {
    use super::*;
    use crate::mem::segment::Segment;

    #[test]
    fn test_null_roundtrip() {
        assert_eq!(decode(encode_null()), Decoded::Null);
    }

    #[test]
    fn test_small_int_roundtrip() {
        for v in [0i64, 1, -1, 12345, -12345, SMALLINT_MAX, SMALLINT_MIN] {
            let w = encode_small_int(v).unwrap();
            assert_eq!(decode(w), Decoded::SmallInt(v));
        }
    }

    #[test]
    fn test_small_int_out_of_range_rejected() {
        assert!(encode_small_int(SMALLINT_MAX + 1).is_none());
        assert!(encode_small_int(SMALLINT_MIN - 1).is_none());
    }

    #[test]
    fn test_char_date_time_anonconst_roundtrip() {
        assert_eq!(decode(encode_char(b'x')), Decoded::Char(b'x'));
        assert_eq!(decode(encode_date(19000)), Decoded::Date(19000));
        assert_eq!(decode(encode_time(86399 * 100)), Decoded::Time(86399 * 100));
        assert_eq!(decode(encode_anon_const(7)), Decoded::AnonConst(7));
    }

    #[test]
    fn test_var_roundtrip() {
        assert_eq!(decode(encode_var(3)), Decoded::Var(3));
    }

    #[test]
    fn test_fixpoint_roundtrip() {
        let w = encode_fixpoint(3.14);
        match decode(w) {
            Decoded::Fixpoint(scaled) => assert_eq!(scaled, 31400),
            other => panic!("unexpected {:?}", other),
        }
        assert!((decode_fixpoint(31400) - 3.14).abs() < 1e-9);
    }

    #[test]
    fn test_full_int_allocates_and_roundtrips() {
        let seg = Segment::attach_local(256 * 1024).unwrap();
        let w = encode_full_int(&seg, i64::MAX / 2).unwrap();
        match decode(w) {
            Decoded::FullInt(off) => assert_eq!(decode_full_int(&seg, off), i64::MAX / 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_double_roundtrips_bit_for_bit() {
        let seg = Segment::attach_local(256 * 1024).unwrap();
        let w = encode_double(&seg, f64::NAN).unwrap();
        match decode(w) {
            Decoded::Double(off) => assert!(decode_double(&seg, off).is_nan()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_short_str_roundtrip() {
        let seg = Segment::attach_local(256 * 1024).unwrap();
        let w = encode_short_str(&seg, b"hello").unwrap();
        match decode(w) {
            Decoded::ShortStr(off) => assert_eq!(decode_short_str(&seg, off), b"hello"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_short_str_too_long_rejected() {
        let seg = Segment::attach_local(256 * 1024).unwrap();
        let big = vec![b'a'; SHORTSTR_MAX_PAYLOAD + 1];
        assert!(encode_short_str(&seg, &big).is_err());
    }

    #[test]
    fn test_record_ref_roundtrip() {
        assert_eq!(decode(encode_record_ref(4096)), Decoded::RecordRef(4096));
    }

    #[test]
    fn test_is_heap_reference() {
        assert!(!is_heap_reference(encode_null()));
        assert!(!is_heap_reference(encode_small_int(1).unwrap()));
        assert!(is_heap_reference(encode_record_ref(4096)));
    }

    #[test]
    fn test_retag_roundtrips_every_variant() {
        let seg = Segment::attach_local(256 * 1024).unwrap();
        let words = [
            encode_null(),
            encode_small_int(7).unwrap(),
            encode_char(b'z'),
            encode_date(1),
            encode_time(2),
            encode_var(3),
            encode_anon_const(4),
            encode_fixpoint(1.5),
            encode_full_int(&seg, 99).unwrap(),
            encode_double(&seg, 2.5).unwrap(),
            encode_short_str(&seg, b"hi").unwrap(),
            encode_long_str(&seg, LONGSTR_TYPE_STR, b"longer than a short string fits", None, true).unwrap(),
            encode_record_ref(4096),
        ];
        for w in words {
            assert_eq!(retag(decode(w)), w);
        }
    }

    #[test]
    fn test_encode_unistr_picks_short_for_small_plain_string() {
        let seg = Segment::attach_local(256 * 1024).unwrap();
        let w = encode_unistr(&seg, LONGSTR_TYPE_STR, b"hi", None, true).unwrap();
        assert!(matches!(decode(w), Decoded::ShortStr(_)));
    }

    #[test]
    fn test_encode_unistr_picks_long_for_tagged_or_oversized() {
        let seg = Segment::attach_local(256 * 1024).unwrap();
        let tagged = encode_unistr(&seg, LONGSTR_TYPE_STR, b"hi", Some(b"en"), true).unwrap();
        assert!(matches!(decode(tagged), Decoded::LongStr(_)));
        let oversized = encode_unistr(&seg, LONGSTR_TYPE_STR, &vec![b'a'; 64], None, true).unwrap();
        assert!(matches!(decode(oversized), Decoded::LongStr(_)));
        let uri = encode_unistr(&seg, LONGSTR_TYPE_URI, b"http://x", None, true).unwrap();
        assert!(matches!(decode(uri), Decoded::LongStr(_)));
    }

    #[test]
    fn fuzz_small_int_roundtrip() {
        bolero::check!()
            .with_type::<i64>()
            .for_each(|v| {
                if let Some(w) = encode_small_int(*v) {
                    assert_eq!(decode(w), Decoded::SmallInt(*v));
                }
            });
    }

    #[test]
    fn fuzz_char_date_time_roundtrip() {
        bolero::check!()
            .with_type::<(u8, i32, i32)>()
            .for_each(|(c, date, time)| {
                assert_eq!(decode(encode_char(*c)), Decoded::Char(*c));
                assert_eq!(decode(encode_date(*date)), Decoded::Date(*date));
                assert_eq!(decode(encode_time(*time)), Decoded::Time(*time));
            });
    }

    #[test]
    fn fuzz_full_int_and_double_roundtrip() {
        let seg = Segment::attach_local(1024 * 1024).unwrap();
        bolero::check!()
            .with_type::<(i64, u64)>()
            .for_each(|(i, bits)| {
                let w = encode_full_int(&seg, *i).unwrap();
                match decode(w) {
                    Decoded::FullInt(off) => assert_eq!(decode_full_int(&seg, off), *i),
                    other => panic!("unexpected {:?}", other),
                }
                free_full_int(&seg, (w & !0b111) as usize);

                let f = f64::from_bits(*bits);
                let w = encode_double(&seg, f).unwrap();
                match decode(w) {
                    Decoded::Double(off) => {
                        let got = decode_double(&seg, off);
                        assert!(got.to_bits() == f.to_bits() || (got.is_nan() && f.is_nan()));
                    }
                    other => panic!("unexpected {:?}", other),
                }
                free_double(&seg, (w & !0b111) as usize);
            });
    }

    #[test]
    fn fuzz_short_str_roundtrip() {
        let seg = Segment::attach_local(1024 * 1024).unwrap();
        bolero::check!()
            .with_type::<Vec<u8>>()
            .for_each(|payload| {
                let payload: Vec<u8> = payload.iter().take(SHORTSTR_MAX_PAYLOAD).copied().collect();
                let w = encode_short_str(&seg, &payload).unwrap();
                match decode(w) {
                    Decoded::ShortStr(off) => assert_eq!(decode_short_str(&seg, off), payload),
                    other => panic!("unexpected {:?}", other),
                }
                free_short_str(&seg, (w & !0b111) as usize);
            });
    }
}
