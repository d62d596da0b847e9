//! On-disk layout.
//!
//! Every file starts with a header block:
//!
//! ```text
//! [magic u32][version u16][alignment u16][file id u64]   (padded to the block size)
//! ```
//!
//! followed by records, each padded to the block size:
//!
//! ```text
//! [kind u8][file id u32][body][crc32 u32]
//! ```
//!
//! The CRC covers kind, file id and body. A zero kind marks the end of the
//! written area. The file id stamp lets replay tell fresh records from
//! leftovers of a recycled file.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{JournalError, JournalResult};

pub const MAGIC: u32 = 0x524D_514A;
pub const VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 16;
/// Header file id of a file sitting in the free pool.
pub const FREE_FILE_ID: u64 = 0;

const RECORD_PREFIX: usize = 1 + 4;
const CRC_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u16,
    pub alignment: u16,
    pub file_id: u64,
}

impl FileHeader {
    pub fn new(file_id: u64, alignment: usize) -> Self {
        Self {
            version: VERSION,
            alignment: alignment as u16,
            file_id,
        }
    }

    pub fn is_free(&self) -> bool {
        self.file_id == FREE_FILE_ID
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.alignment);
        buf.put_u64(self.file_id);
    }

    pub fn decode(mut buf: &[u8]) -> JournalResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(JournalError::Corruption("short file header".into()));
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(JournalError::Corruption(format!("bad magic {magic:#x}")));
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(JournalError::Corruption(format!(
                "unsupported version {version}"
            )));
        }
        Ok(Self {
            version,
            alignment: buf.get_u16(),
            file_id: buf.get_u64(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Add = 1,
    Update = 2,
    Delete = 3,
    AddTx = 4,
    UpdateTx = 5,
    DeleteTx = 6,
    Prepare = 7,
    Commit = 8,
    Rollback = 9,
}

impl RecordKind {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Add,
            2 => Self::Update,
            3 => Self::Delete,
            4 => Self::AddTx,
            5 => Self::UpdateTx,
            6 => Self::DeleteTx,
            7 => Self::Prepare,
            8 => Self::Commit,
            9 => Self::Rollback,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Add { id: u64, user_type: u8, data: Bytes },
    Update { id: u64, user_type: u8, data: Bytes },
    Delete { id: u64 },
    AddTx { tx_id: u64, id: u64, user_type: u8, data: Bytes },
    UpdateTx { tx_id: u64, id: u64, user_type: u8, data: Bytes },
    DeleteTx { tx_id: u64, id: u64 },
    Prepare { tx_id: u64, data: Bytes },
    Commit { tx_id: u64 },
    Rollback { tx_id: u64 },
}

/// Outcome of decoding at one position.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A record and the number of bytes it occupies before padding.
    Record(Record, usize),
    /// Unwritten space.
    End,
    /// Left over from an earlier use of a recycled file.
    Foreign(u32),
    /// Torn or corrupt.
    Invalid(String),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Add { .. } => RecordKind::Add,
            Record::Update { .. } => RecordKind::Update,
            Record::Delete { .. } => RecordKind::Delete,
            Record::AddTx { .. } => RecordKind::AddTx,
            Record::UpdateTx { .. } => RecordKind::UpdateTx,
            Record::DeleteTx { .. } => RecordKind::DeleteTx,
            Record::Prepare { .. } => RecordKind::Prepare,
            Record::Commit { .. } => RecordKind::Commit,
            Record::Rollback { .. } => RecordKind::Rollback,
        }
    }

    pub fn tx_id(&self) -> Option<u64> {
        match self {
            Record::AddTx { tx_id, .. }
            | Record::UpdateTx { tx_id, .. }
            | Record::DeleteTx { tx_id, .. }
            | Record::Prepare { tx_id, .. }
            | Record::Commit { tx_id }
            | Record::Rollback { tx_id } => Some(*tx_id),
            _ => None,
        }
    }

    fn body_size(&self) -> usize {
        match self {
            Record::Add { data, .. } | Record::Update { data, .. } => 8 + 1 + 4 + data.len(),
            Record::Delete { .. } => 8,
            Record::AddTx { data, .. } | Record::UpdateTx { data, .. } => {
                8 + 8 + 1 + 4 + data.len()
            }
            Record::DeleteTx { .. } => 16,
            Record::Prepare { data, .. } => 8 + 4 + data.len(),
            Record::Commit { .. } | Record::Rollback { .. } => 8,
        }
    }

    /// Size on disk before block padding.
    pub fn encoded_size(&self) -> usize {
        RECORD_PREFIX + self.body_size() + CRC_SIZE
    }

    pub fn encode(&self, file_id: u64, buf: &mut BytesMut) {
        let start = buf.len();
        buf.reserve(self.encoded_size());
        buf.put_u8(self.kind() as u8);
        buf.put_u32(file_id as u32);
        match self {
            Record::Add { id, user_type, data } | Record::Update { id, user_type, data } => {
                buf.put_u64(*id);
                buf.put_u8(*user_type);
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
            Record::Delete { id } => buf.put_u64(*id),
            Record::AddTx {
                tx_id,
                id,
                user_type,
                data,
            }
            | Record::UpdateTx {
                tx_id,
                id,
                user_type,
                data,
            } => {
                buf.put_u64(*tx_id);
                buf.put_u64(*id);
                buf.put_u8(*user_type);
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
            Record::DeleteTx { tx_id, id } => {
                buf.put_u64(*tx_id);
                buf.put_u64(*id);
            }
            Record::Prepare { tx_id, data } => {
                buf.put_u64(*tx_id);
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
            Record::Commit { tx_id } | Record::Rollback { tx_id } => buf.put_u64(*tx_id),
        }
        let crc = crc32fast::hash(&buf[start..]);
        buf.put_u32(crc);
    }

    /// Decodes the record at the start of `buf`, which must belong to file
    /// `file_id`.
    pub fn decode(buf: &[u8], file_id: u64) -> Decoded {
        if buf.is_empty() || buf[0] == 0 {
            return Decoded::End;
        }
        let Some(kind) = RecordKind::from_u8(buf[0]) else {
            return Decoded::Invalid(format!("unknown record kind {}", buf[0]));
        };
        if buf.len() < RECORD_PREFIX {
            return Decoded::Invalid("truncated record".into());
        }
        let stamped = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if stamped != file_id as u32 {
            return Decoded::Foreign(stamped);
        }

        let mut body = &buf[RECORD_PREFIX..];
        let record = match Self::decode_body(kind, &mut body) {
            Some(record) => record,
            None => return Decoded::Invalid("truncated record".into()),
        };
        let size = record.encoded_size();
        if buf.len() < size {
            return Decoded::Invalid("truncated record".into());
        }
        let crc_at = size - CRC_SIZE;
        let expected = u32::from_be_bytes([
            buf[crc_at],
            buf[crc_at + 1],
            buf[crc_at + 2],
            buf[crc_at + 3],
        ]);
        if crc32fast::hash(&buf[..crc_at]) != expected {
            return Decoded::Invalid("crc mismatch".into());
        }
        Decoded::Record(record, size)
    }

    fn decode_body(kind: RecordKind, buf: &mut &[u8]) -> Option<Record> {
        fn data(buf: &mut &[u8]) -> Option<Bytes> {
            if buf.remaining() < 4 {
                return None;
            }
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                return None;
            }
            let data = Bytes::copy_from_slice(&buf[..len]);
            buf.advance(len);
            Some(data)
        }
        fn u64_of(buf: &mut &[u8]) -> Option<u64> {
            (buf.remaining() >= 8).then(|| buf.get_u64())
        }
        fn u8_of(buf: &mut &[u8]) -> Option<u8> {
            (buf.remaining() >= 1).then(|| buf.get_u8())
        }

        Some(match kind {
            RecordKind::Add => Record::Add {
                id: u64_of(buf)?,
                user_type: u8_of(buf)?,
                data: data(buf)?,
            },
            RecordKind::Update => Record::Update {
                id: u64_of(buf)?,
                user_type: u8_of(buf)?,
                data: data(buf)?,
            },
            RecordKind::Delete => Record::Delete { id: u64_of(buf)? },
            RecordKind::AddTx => Record::AddTx {
                tx_id: u64_of(buf)?,
                id: u64_of(buf)?,
                user_type: u8_of(buf)?,
                data: data(buf)?,
            },
            RecordKind::UpdateTx => Record::UpdateTx {
                tx_id: u64_of(buf)?,
                id: u64_of(buf)?,
                user_type: u8_of(buf)?,
                data: data(buf)?,
            },
            RecordKind::DeleteTx => Record::DeleteTx {
                tx_id: u64_of(buf)?,
                id: u64_of(buf)?,
            },
            RecordKind::Prepare => Record::Prepare {
                tx_id: u64_of(buf)?,
                data: data(buf)?,
            },
            RecordKind::Commit => Record::Commit { tx_id: u64_of(buf)? },
            RecordKind::Rollback => Record::Rollback { tx_id: u64_of(buf)? },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(record: &Record, file_id: u64) -> BytesMut {
        let mut buf = BytesMut::new();
        record.encode(file_id, &mut buf);
        buf
    }

    #[test]
    fn header_rejects_garbage() {
        let mut buf = BytesMut::new();
        FileHeader::new(9, 512).encode(&mut buf);
        assert_eq!(FileHeader::decode(&buf).unwrap().file_id, 9);
        assert!(FileHeader::decode(&[0u8; 16]).is_err());
        assert!(FileHeader::decode(&buf[..10]).is_err());
    }

    #[test]
    fn record_decodes_and_reports_size() {
        let record = Record::AddTx {
            tx_id: 7,
            id: 42,
            user_type: 31,
            data: Bytes::from_static(b"payload"),
        };
        let mut buf = encoded(&record, 3);
        assert_eq!(buf.len(), record.encoded_size());
        buf.put_bytes(0, 32);
        assert_eq!(
            Record::decode(&buf, 3),
            Decoded::Record(record.clone(), record.encoded_size())
        );
        assert_eq!(Record::decode(&buf[record.encoded_size()..], 3), Decoded::End);
    }

    #[test]
    fn foreign_and_torn_records_are_rejected() {
        let record = Record::Add {
            id: 1,
            user_type: 1,
            data: Bytes::from_static(b"abcdef"),
        };
        let buf = encoded(&record, 5);
        assert_eq!(Record::decode(&buf, 6), Decoded::Foreign(5));
        assert!(matches!(Record::decode(&buf[..buf.len() - 2], 5), Decoded::Invalid(_)));

        let mut flipped = buf.clone();
        flipped[10] ^= 0xFF;
        assert!(matches!(Record::decode(&flipped, 5), Decoded::Invalid(_)));
    }
}
