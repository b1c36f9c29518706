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

//! Journal entry wire format (§4.I). Every field is a little-endian
//! 8-byte word, matching the segment's own word size, so a reader never
//! has to reason about mixed widths. Entries carry no length prefix or
//! per-entry checksum: the journal is trusted to have been written in
//! full (§4.I "first journal entry is written and flushed; only then is
//! the shared segment mutated"), and a short read at the tail is treated
//! as a clean end of file rather than corruption.

use std::io::{self, Read, Write};

use crate::encoding::LONGSTR_TYPE_BLOB;
use crate::encoding::LONGSTR_TYPE_STR;
use crate::encoding::LONGSTR_TYPE_URI;
use crate::encoding::LONGSTR_TYPE_XML;

const TAG_CRE: i64 = 1;
const TAG_DEL: i64 = 2;
const TAG_ENC: i64 = 3;
const TAG_SET: i64 = 4;

const VTYPE_FULLINT: i64 = 0;
const VTYPE_DOUBLE: i64 = 1;
const VTYPE_STR: i64 = 2;
const VTYPE_URI: i64 = 3;
const VTYPE_XML: i64 = 4;
const VTYPE_BLOB: i64 = 5;

/// Which of the heap-allocating encode domains an `Encode` entry covers.
/// Immediates (null, small int, char, date, time, var, anon const,
/// record ref) never reach the journal: encoding them never touches the
/// segment, so there is nothing to replay (§4.I "types that produce no
/// allocation... are not logged").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    FullInt,
    Double,
    Str,
    Uri,
    Xml,
    Blob,
}

impl ValueType {
    fn to_tag(self) -> i64 {
        match self {
            ValueType::FullInt => VTYPE_FULLINT,
            ValueType::Double => VTYPE_DOUBLE,
            ValueType::Str => VTYPE_STR,
            ValueType::Uri => VTYPE_URI,
            ValueType::Xml => VTYPE_XML,
            ValueType::Blob => VTYPE_BLOB,
        }
    }

    fn from_tag(tag: i64) -> io::Result<ValueType> {
        Ok(match tag {
            VTYPE_FULLINT => ValueType::FullInt,
            VTYPE_DOUBLE => ValueType::Double,
            VTYPE_STR => ValueType::Str,
            VTYPE_URI => ValueType::Uri,
            VTYPE_XML => ValueType::Xml,
            VTYPE_BLOB => ValueType::Blob,
            _ => return Err(bad("unknown journal value type tag")),
        })
    }

    /// The long-string `kind` byte this value type corresponds to, or
    /// `None` for the two domains that aren't long strings.
    pub fn longstr_kind(self) -> Option<u8> {
        match self {
            ValueType::Str => Some(LONGSTR_TYPE_STR),
            ValueType::Uri => Some(LONGSTR_TYPE_URI),
            ValueType::Xml => Some(LONGSTR_TYPE_XML),
            ValueType::Blob => Some(LONGSTR_TYPE_BLOB),
            ValueType::FullInt | ValueType::Double => None,
        }
    }
}

/// The data an `Encode` entry needs to redo the original `encode_*` call
/// during replay.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Int(i64),
    Double(f64),
    Bytes { payload: Vec<u8>, secondary: Vec<u8> },
}

/// One logical mutation as it appears in the journal (§4.I).
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Create { length: i64, offset: i64 },
    Delete { offset: i64 },
    Encode { vtype: ValueType, payload: Payload, result: i64 },
    Set { offset: i64, column: i64, value: i64 },
}

fn bad(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn write_word(w: &mut impl Write, v: i64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_word(r: &mut impl Read) -> io::Result<Option<i64>> {
    let mut buf = [0u8; 8];
    let mut read = 0;
    while read < 8 {
        match r.read(&mut buf[read..]) {
            Ok(0) if read == 0 => return Ok(None),
            Ok(0) => return Err(bad("journal entry truncated mid-word")),
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Some(i64::from_le_bytes(buf)))
}

fn read_word_required(r: &mut impl Read) -> io::Result<i64> {
    read_word(r)?.ok_or_else(|| bad("journal entry truncated"))
}

fn read_bytes(r: &mut impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

impl Entry {
    pub fn write(&self, w: &mut impl Write) -> io::Result<()> {
        match self {
            Entry::Create { length, offset } => {
                write_word(w, TAG_CRE)?;
                write_word(w, *length)?;
                write_word(w, *offset)
            }
            Entry::Delete { offset } => {
                write_word(w, TAG_DEL)?;
                write_word(w, *offset)
            }
            Entry::Encode { vtype, payload, result } => {
                write_word(w, TAG_ENC)?;
                write_word(w, vtype.to_tag())?;
                match payload {
                    Payload::Int(v) => write_word(w, *v)?,
                    Payload::Double(v) => write_word(w, v.to_bits() as i64)?,
                    Payload::Bytes { payload, secondary } => {
                        write_word(w, payload.len() as i64)?;
                        write_word(w, secondary.len() as i64)?;
                        w.write_all(payload)?;
                        w.write_all(secondary)?;
                    }
                }
                write_word(w, *result)
            }
            Entry::Set { offset, column, value } => {
                write_word(w, TAG_SET)?;
                write_word(w, *offset)?;
                write_word(w, *column)?;
                write_word(w, *value)
            }
        }
    }

    /// Reads one entry, or `None` at a clean end of file (no partial tag
    /// word pending).
    pub fn read(r: &mut impl Read) -> io::Result<Option<Entry>> {
        let tag = match read_word(r)? {
            Some(t) => t,
            None => return Ok(None),
        };
        Ok(Some(match tag {
            TAG_CRE => Entry::Create {
                length: read_word_required(r)?,
                offset: read_word_required(r)?,
            },
            TAG_DEL => Entry::Delete { offset: read_word_required(r)? },
            TAG_ENC => {
                let vtype = ValueType::from_tag(read_word_required(r)?)?;
                let payload = match vtype {
                    ValueType::FullInt => Payload::Int(read_word_required(r)?),
                    ValueType::Double => {
                        Payload::Double(f64::from_bits(read_word_required(r)? as u64))
                    }
                    ValueType::Str | ValueType::Uri | ValueType::Xml | ValueType::Blob => {
                        let len = read_word_required(r)? as usize;
                        let extlen = read_word_required(r)? as usize;
                        let payload = read_bytes(r, len)?;
                        let secondary = read_bytes(r, extlen)?;
                        Payload::Bytes { payload, secondary }
                    }
                };
                let result = read_word_required(r)?;
                Entry::Encode { vtype, payload, result }
            }
            TAG_SET => Entry::Set {
                offset: read_word_required(r)?,
                column: read_word_required(r)?,
                value: read_word_required(r)?,
            },
            _ => return Err(bad("invalid journal entry tag")),
        }))
    }
}

#[cfg(test)]
mod test_entry {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(e: Entry) {
        let mut buf = Vec::new();
        e.write(&mut buf).unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(Entry::read(&mut cur).unwrap(), Some(e));
        assert_eq!(Entry::read(&mut cur).unwrap(), None);
    }

    #[test]
    fn test_create_roundtrip() {
        roundtrip(Entry::Create { length: 3, offset: 4096 });
    }

    #[test]
    fn test_delete_roundtrip() {
        roundtrip(Entry::Delete { offset: 4096 });
    }

    #[test]
    fn test_set_roundtrip() {
        roundtrip(Entry::Set { offset: 4096, column: 2, value: 24 });
    }

    #[test]
    fn test_encode_int_roundtrip() {
        roundtrip(Entry::Encode {
            vtype: ValueType::FullInt,
            payload: Payload::Int(i64::MIN / 2),
            result: 4104,
        });
    }

    #[test]
    fn test_encode_double_roundtrip() {
        roundtrip(Entry::Encode {
            vtype: ValueType::Double,
            payload: Payload::Double(f64::NAN),
            result: 4104,
        });
    }

    #[test]
    fn test_encode_str_with_secondary_roundtrip() {
        roundtrip(Entry::Encode {
            vtype: ValueType::Str,
            payload: Payload::Bytes {
                payload: b"hello".to_vec(),
                secondary: b"en".to_vec(),
            },
            result: 8192,
        });
    }

    #[test]
    fn test_truncated_tail_is_clean_eof() {
        let mut buf = Vec::new();
        Entry::Delete { offset: 4096 }.write(&mut buf).unwrap();
        buf.truncate(4); // cut mid-word, only the tag is intact past its first half
        let mut cur = Cursor::new(buf);
        assert!(Entry::read(&mut cur).is_err());
    }

    #[test]
    fn test_no_entries_is_clean_eof() {
        let mut cur = Cursor::new(Vec::<u8>::new());
        assert_eq!(Entry::read(&mut cur).unwrap(), None);
    }
}
