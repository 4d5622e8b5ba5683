//! Version edits: the deltas recorded in the manifest.
//!
//! Each edit is an atomic change to the live file set, encoded as a
//! sequence of tagged fields:
//!
//! ```text
//! +---------+------------------+---------+------------------+-----+
//! | tag: u8 | field payload    | tag: u8 | field payload    | ... |
//! +---------+------------------+---------+------------------+-----+
//! ```
//!
//! Keys are length-prefixed (u32), every integer big-endian. A manifest is
//! replayed by applying edits in order to an empty state; the first record
//! of a manifest is a snapshot edit describing the entire version.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::config::NUM_LEVELS;
use crate::error::Result;
use crate::ikey::InternalKey;
use crate::{corruption, Error};

const TAG_LOG_NUMBER: u8 = 0x01;
const TAG_NEXT_FILE_NUMBER: u8 = 0x02;
const TAG_LAST_SEQUENCE: u8 = 0x03;
const TAG_COMPACT_POINTER: u8 = 0x04;
const TAG_DELETED_FILE: u8 = 0x05;
const TAG_NEW_FILE: u8 = 0x06;

/// Metadata for a file being added to a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub number: u64,
    pub size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
}

/// A delta over the current version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionEdit {
    pub log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<u64>,
    pub compact_pointers: Vec<(usize, InternalKey)>,
    pub deleted_files: Vec<(usize, u64)>,
    pub new_files: Vec<(usize, NewFile)>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_log_number(&mut self, number: u64) -> &mut Self {
        self.log_number = Some(number);
        self
    }

    pub fn set_next_file_number(&mut self, number: u64) -> &mut Self {
        self.next_file_number = Some(number);
        self
    }

    pub fn set_last_sequence(&mut self, seq: u64) -> &mut Self {
        self.last_sequence = Some(seq);
        self
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) -> &mut Self {
        self.compact_pointers.push((level, key));
        self
    }

    pub fn delete_file(&mut self, level: usize, number: u64) -> &mut Self {
        self.deleted_files.push((level, number));
        self
    }

    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) -> &mut Self {
        self.new_files.push((
            level,
            NewFile {
                number,
                size,
                smallest,
                largest,
            },
        ));
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        if let Some(number) = self.log_number {
            buf.write_u8(TAG_LOG_NUMBER).unwrap();
            buf.write_u64::<BigEndian>(number).unwrap();
        }
        if let Some(number) = self.next_file_number {
            buf.write_u8(TAG_NEXT_FILE_NUMBER).unwrap();
            buf.write_u64::<BigEndian>(number).unwrap();
        }
        if let Some(seq) = self.last_sequence {
            buf.write_u8(TAG_LAST_SEQUENCE).unwrap();
            buf.write_u64::<BigEndian>(seq).unwrap();
        }
        for (level, key) in &self.compact_pointers {
            buf.write_u8(TAG_COMPACT_POINTER).unwrap();
            buf.write_u32::<BigEndian>(*level as u32).unwrap();
            write_key(&mut buf, key);
        }
        for (level, number) in &self.deleted_files {
            buf.write_u8(TAG_DELETED_FILE).unwrap();
            buf.write_u32::<BigEndian>(*level as u32).unwrap();
            buf.write_u64::<BigEndian>(*number).unwrap();
        }
        for (level, file) in &self.new_files {
            buf.write_u8(TAG_NEW_FILE).unwrap();
            buf.write_u32::<BigEndian>(*level as u32).unwrap();
            buf.write_u64::<BigEndian>(file.number).unwrap();
            buf.write_u64::<BigEndian>(file.size).unwrap();
            write_key(&mut buf, &file.smallest);
            write_key(&mut buf, &file.largest);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let mut edit = VersionEdit::new();

        while (cursor.position() as usize) < data.len() {
            let tag = cursor.read_u8()?;
            match tag {
                TAG_LOG_NUMBER => {
                    edit.log_number = Some(cursor.read_u64::<BigEndian>()?);
                }
                TAG_NEXT_FILE_NUMBER => {
                    edit.next_file_number = Some(cursor.read_u64::<BigEndian>()?);
                }
                TAG_LAST_SEQUENCE => {
                    edit.last_sequence = Some(cursor.read_u64::<BigEndian>()?);
                }
                TAG_COMPACT_POINTER => {
                    let level = read_level(&mut cursor)?;
                    let key = read_key(&mut cursor)?;
                    edit.compact_pointers.push((level, key));
                }
                TAG_DELETED_FILE => {
                    let level = read_level(&mut cursor)?;
                    let number = cursor.read_u64::<BigEndian>()?;
                    edit.deleted_files.push((level, number));
                }
                TAG_NEW_FILE => {
                    let level = read_level(&mut cursor)?;
                    let number = cursor.read_u64::<BigEndian>()?;
                    let size = cursor.read_u64::<BigEndian>()?;
                    let smallest = read_key(&mut cursor)?;
                    let largest = read_key(&mut cursor)?;
                    edit.new_files.push((
                        level,
                        NewFile {
                            number,
                            size,
                            smallest,
                            largest,
                        },
                    ));
                }
                _ => return Err(Error::Corruption(format!("unknown version edit tag {tag}"))),
            }
        }
        Ok(edit)
    }
}

fn write_key(buf: &mut Vec<u8>, key: &InternalKey) {
    let bytes = key.as_bytes();
    buf.write_u32::<BigEndian>(bytes.len() as u32).unwrap();
    buf.extend_from_slice(bytes);
}

fn read_key(cursor: &mut Cursor<&[u8]>) -> Result<InternalKey> {
    let len = cursor.read_u32::<BigEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    if bytes.len() < crate::ikey::TRAILER_SIZE {
        return Err(corruption!("version edit key shorter than a trailer"));
    }
    Ok(InternalKey::from_vec(bytes))
}

fn read_level(cursor: &mut Cursor<&[u8]>) -> Result<usize> {
    let level = cursor.read_u32::<BigEndian>()? as usize;
    if level >= NUM_LEVELS {
        return Err(corruption!("version edit level {level} out of range"));
    }
    Ok(level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikey::ValueType;

    fn key(user: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(user, seq, ValueType::Value)
    }

    #[test]
    fn empty_edit_roundtrip() {
        let edit = VersionEdit::new();
        let decoded = VersionEdit::decode(&edit.encode()).expect("decode");
        assert_eq!(decoded, edit);
    }

    #[test]
    fn full_edit_roundtrip() {
        let mut edit = VersionEdit::new();
        edit.set_log_number(9)
            .set_next_file_number(42)
            .set_last_sequence(12345)
            .set_compact_pointer(1, key(b"cursor", 7))
            .delete_file(2, 17)
            .delete_file(2, 18)
            .add_file(3, 40, 4096, key(b"aardvark", 5), key(b"zebra", 9));

        let decoded = VersionEdit::decode(&edit.encode()).expect("decode");
        assert_eq!(decoded, edit);
    }

    #[test]
    fn unknown_tag_rejected() {
        let result = VersionEdit::decode(&[0xee]);
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn out_of_range_level_rejected() {
        let mut edit = VersionEdit::new();
        edit.delete_file(0, 5);
        let mut encoded = edit.encode();
        // Corrupt the level field.
        encoded[4] = 0xff;
        assert!(VersionEdit::decode(&encoded).is_err());
    }
}
