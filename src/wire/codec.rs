//! Checked big-endian primitives shared by message, storage and packet codecs.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::error::{BrokerError, Result};

#[inline]
fn need(buf: &&[u8], len: usize, what: &str) -> Result<()> {
    if buf.remaining() < len {
        return Err(BrokerError::Decode(format!(
            "truncated while reading {what}: need {len} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

pub fn get_u8(buf: &mut &[u8], what: &str) -> Result<u8> {
    need(buf, 1, what)?;
    Ok(buf.get_u8())
}

pub fn get_bool(buf: &mut &[u8], what: &str) -> Result<bool> {
    match get_u8(buf, what)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(BrokerError::Decode(format!("invalid boolean {other} for {what}"))),
    }
}

pub fn get_u16(buf: &mut &[u8], what: &str) -> Result<u16> {
    need(buf, 2, what)?;
    Ok(buf.get_u16())
}

pub fn get_u32(buf: &mut &[u8], what: &str) -> Result<u32> {
    need(buf, 4, what)?;
    Ok(buf.get_u32())
}

pub fn get_i32(buf: &mut &[u8], what: &str) -> Result<i32> {
    need(buf, 4, what)?;
    Ok(buf.get_i32())
}

pub fn get_u64(buf: &mut &[u8], what: &str) -> Result<u64> {
    need(buf, 8, what)?;
    Ok(buf.get_u64())
}

pub fn get_i64(buf: &mut &[u8], what: &str) -> Result<i64> {
    need(buf, 8, what)?;
    Ok(buf.get_i64())
}

pub fn get_f64(buf: &mut &[u8], what: &str) -> Result<f64> {
    need(buf, 8, what)?;
    Ok(buf.get_f64())
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Strings carry a u16 length prefix.
pub fn put_string(buf: &mut BytesMut, value: &str) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        BrokerError::InvalidArgument(format!("string of {} bytes is too long", value.len()))
    })?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

pub fn get_string(buf: &mut &[u8], what: &str) -> Result<String> {
    let len = get_u16(buf, what)? as usize;
    need(buf, len, what)?;
    let (head, tail) = buf.split_at(len);
    let value = std::str::from_utf8(head)
        .map_err(|_| BrokerError::Decode(format!("{what} is not valid UTF-8")))?
        .to_string();
    *buf = tail;
    Ok(value)
}

pub fn put_opt_string(buf: &mut BytesMut, value: Option<&str>) -> Result<()> {
    match value {
        Some(v) => {
            buf.put_u8(1);
            put_string(buf, v)
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

pub fn get_opt_string(buf: &mut &[u8], what: &str) -> Result<Option<String>> {
    if get_bool(buf, what)? {
        get_string(buf, what).map(Some)
    } else {
        Ok(None)
    }
}

/// Byte blobs carry a u32 length prefix.
pub fn put_bytes(buf: &mut BytesMut, value: &[u8]) -> Result<()> {
    let len = u32::try_from(value.len()).map_err(|_| {
        BrokerError::InvalidArgument(format!("blob of {} bytes is too long", value.len()))
    })?;
    buf.put_u32(len);
    buf.put_slice(value);
    Ok(())
}

pub fn get_bytes(buf: &mut &[u8], what: &str) -> Result<Bytes> {
    let len = get_u32(buf, what)? as usize;
    need(buf, len, what)?;
    Ok(buf.copy_to_bytes(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_string_is_a_decode_error() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "hello").unwrap();
        let frozen = buf.freeze();
        let mut slice = &frozen[..4];
        assert!(matches!(
            get_string(&mut slice, "name"),
            Err(BrokerError::Decode(_))
        ));
    }

    #[test]
    fn optional_strings() {
        let mut buf = BytesMut::new();
        put_opt_string(&mut buf, Some("x")).unwrap();
        put_opt_string(&mut buf, None).unwrap();
        let frozen = buf.freeze();
        let mut slice = &frozen[..];
        assert_eq!(get_opt_string(&mut slice, "a").unwrap().as_deref(), Some("x"));
        assert_eq!(get_opt_string(&mut slice, "b").unwrap(), None);
        assert!(slice.is_empty());
    }
}
