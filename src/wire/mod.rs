//! Packet codec used by the TCP adapter.
//!
//! Every frame is `[u32 length][u8 type][body]`, big-endian, where
//! `length` covers the type byte and the body.

pub mod codec;

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};

use crate::core::error::{BrokerError, Result};
use crate::core::message::ServerMessage;
use crate::core::session::SessionKind;

/// Largest frame accepted from a client.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

const CREATE_SESSION: u8 = 1;
const CREATE_QUEUE: u8 = 2;
const DELETE_QUEUE: u8 = 3;
const CREATE_PRODUCER: u8 = 4;
const CLOSE_PRODUCER: u8 = 5;
const CREATE_CONSUMER: u8 = 6;
const CLOSE_CONSUMER: u8 = 7;
const START: u8 = 8;
const STOP: u8 = 9;
const SEND: u8 = 10;
const ACKNOWLEDGE: u8 = 11;
const INDIVIDUAL_ACKNOWLEDGE: u8 = 12;
const CONSUMER_CREDITS: u8 = 13;
const COMMIT: u8 = 14;
const ROLLBACK: u8 = 15;
const CLOSE: u8 = 16;

const DELIVER: u8 = 40;
const PRODUCER_CREDITS: u8 = 41;
const RESPONSE: u8 = 42;
const REPLICATION_PAGE_EVENT: u8 = 43;

/// Tells a backup that a paging store created or removed a page file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationPageEvent {
    pub store_name: String,
    pub page_number: i32,
    pub is_delete: bool,
}

impl ReplicationPageEvent {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        codec::put_string(buf, &self.store_name)?;
        buf.put_i32(self.page_number);
        codec::put_bool(buf, self.is_delete);
        Ok(())
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            store_name: codec::get_string(buf, "store name")?,
            page_number: codec::get_i32(buf, "page number")?,
            is_delete: codec::get_bool(buf, "is delete")?,
        })
    }
}

#[derive(Debug)]
pub enum Packet {
    // client → broker
    CreateSession {
        kind: SessionKind,
        transacted: bool,
    },
    CreateQueue {
        name: String,
        address: String,
        filter: Option<String>,
        durable: bool,
        temporary: bool,
    },
    DeleteQueue {
        name: String,
    },
    CreateProducer {
        producer_id: u64,
        /// `None` creates an anonymous producer.
        address: Option<String>,
    },
    CloseProducer {
        producer_id: u64,
    },
    CreateConsumer {
        consumer_id: u64,
        /// Queue name, or the address to subscribe to on topic sessions.
        queue: String,
        filter: Option<String>,
        window_size: i64,
    },
    CloseConsumer {
        consumer_id: u64,
    },
    Start,
    Stop,
    Send {
        producer_id: u64,
        message: ServerMessage,
    },
    Acknowledge {
        consumer_id: u64,
        message_id: u64,
    },
    IndividualAcknowledge {
        consumer_id: u64,
        message_id: u64,
    },
    ConsumerCredits {
        consumer_id: u64,
        credits: i64,
    },
    Commit,
    Rollback,
    Close,

    // broker → client
    Deliver {
        consumer_id: u64,
        delivery_count: u32,
        message: Arc<ServerMessage>,
    },
    ProducerCredits {
        producer_id: u64,
        credits: i64,
    },
    Response {
        success: bool,
        error: Option<String>,
    },
    ReplicationPageEvent(ReplicationPageEvent),
}

impl Packet {
    pub fn type_byte(&self) -> u8 {
        match self {
            Packet::CreateSession { .. } => CREATE_SESSION,
            Packet::CreateQueue { .. } => CREATE_QUEUE,
            Packet::DeleteQueue { .. } => DELETE_QUEUE,
            Packet::CreateProducer { .. } => CREATE_PRODUCER,
            Packet::CloseProducer { .. } => CLOSE_PRODUCER,
            Packet::CreateConsumer { .. } => CREATE_CONSUMER,
            Packet::CloseConsumer { .. } => CLOSE_CONSUMER,
            Packet::Start => START,
            Packet::Stop => STOP,
            Packet::Send { .. } => SEND,
            Packet::Acknowledge { .. } => ACKNOWLEDGE,
            Packet::IndividualAcknowledge { .. } => INDIVIDUAL_ACKNOWLEDGE,
            Packet::ConsumerCredits { .. } => CONSUMER_CREDITS,
            Packet::Commit => COMMIT,
            Packet::Rollback => ROLLBACK,
            Packet::Close => CLOSE,
            Packet::Deliver { .. } => DELIVER,
            Packet::ProducerCredits { .. } => PRODUCER_CREDITS,
            Packet::Response { .. } => RESPONSE,
            Packet::ReplicationPageEvent(_) => REPLICATION_PAGE_EVENT,
        }
    }

    pub fn ok() -> Self {
        Packet::Response {
            success: true,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Packet::Response {
            success: false,
            error: Some(message.into()),
        }
    }

    /// Appends one complete frame to `out`.
    pub fn encode_frame(&self, out: &mut BytesMut) -> Result<()> {
        let start = out.len();
        out.put_u32(0);
        out.put_u8(self.type_byte());
        self.encode_body(out)?;
        let len = out.len() - start - 4;
        if len > MAX_FRAME_LEN {
            out.truncate(start);
            return Err(BrokerError::InvalidArgument(format!(
                "frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
            )));
        }
        out[start..start + 4].copy_from_slice(&(len as u32).to_be_bytes());
        Ok(())
    }

    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Packet::CreateSession { kind, transacted } => {
                buf.put_u8(kind.to_byte());
                codec::put_bool(buf, *transacted);
            }
            Packet::CreateQueue {
                name,
                address,
                filter,
                durable,
                temporary,
            } => {
                codec::put_string(buf, name)?;
                codec::put_string(buf, address)?;
                codec::put_opt_string(buf, filter.as_deref())?;
                codec::put_bool(buf, *durable);
                codec::put_bool(buf, *temporary);
            }
            Packet::DeleteQueue { name } => codec::put_string(buf, name)?,
            Packet::CreateProducer {
                producer_id,
                address,
            } => {
                buf.put_u64(*producer_id);
                codec::put_opt_string(buf, address.as_deref())?;
            }
            Packet::CloseProducer { producer_id } => buf.put_u64(*producer_id),
            Packet::CreateConsumer {
                consumer_id,
                queue,
                filter,
                window_size,
            } => {
                buf.put_u64(*consumer_id);
                codec::put_string(buf, queue)?;
                codec::put_opt_string(buf, filter.as_deref())?;
                buf.put_i64(*window_size);
            }
            Packet::CloseConsumer { consumer_id } => buf.put_u64(*consumer_id),
            Packet::Start | Packet::Stop | Packet::Commit | Packet::Rollback | Packet::Close => {}
            Packet::Send {
                producer_id,
                message,
            } => {
                buf.put_u64(*producer_id);
                message.encode(buf)?;
            }
            Packet::Acknowledge {
                consumer_id,
                message_id,
            }
            | Packet::IndividualAcknowledge {
                consumer_id,
                message_id,
            } => {
                buf.put_u64(*consumer_id);
                buf.put_u64(*message_id);
            }
            Packet::ConsumerCredits {
                consumer_id,
                credits,
            } => {
                buf.put_u64(*consumer_id);
                buf.put_i64(*credits);
            }
            Packet::Deliver {
                consumer_id,
                delivery_count,
                message,
            } => {
                buf.put_u64(*consumer_id);
                buf.put_u32(*delivery_count);
                message.encode(buf)?;
            }
            Packet::ProducerCredits {
                producer_id,
                credits,
            } => {
                buf.put_u64(*producer_id);
                buf.put_i64(*credits);
            }
            Packet::Response { success, error } => {
                codec::put_bool(buf, *success);
                codec::put_opt_string(buf, error.as_deref())?;
            }
            Packet::ReplicationPageEvent(event) => event.encode(buf)?,
        }
        Ok(())
    }

    /// Splits one complete frame off `buf` and decodes it. Returns
    /// `Ok(None)` while the frame is still incomplete.
    pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Packet>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len == 0 || len > MAX_FRAME_LEN {
            return Err(BrokerError::Decode(format!("invalid frame length {len}")));
        }
        if buf.len() < 4 + len {
            return Ok(None);
        }
        let mut frame = buf.split_to(4 + len);
        frame.advance(4);
        let mut body: &[u8] = &frame;
        let kind = codec::get_u8(&mut body, "packet type")?;
        let packet = Self::decode_body(kind, &mut body)?;
        if !body.is_empty() {
            return Err(BrokerError::Decode(format!(
                "{} trailing bytes after packet type {kind}",
                body.len()
            )));
        }
        Ok(Some(packet))
    }

    fn decode_body(kind: u8, buf: &mut &[u8]) -> Result<Packet> {
        let packet = match kind {
            CREATE_SESSION => Packet::CreateSession {
                kind: SessionKind::from_byte(codec::get_u8(buf, "session kind")?)?,
                transacted: codec::get_bool(buf, "transacted")?,
            },
            CREATE_QUEUE => Packet::CreateQueue {
                name: codec::get_string(buf, "queue name")?,
                address: codec::get_string(buf, "address")?,
                filter: codec::get_opt_string(buf, "filter")?,
                durable: codec::get_bool(buf, "durable")?,
                temporary: codec::get_bool(buf, "temporary")?,
            },
            DELETE_QUEUE => Packet::DeleteQueue {
                name: codec::get_string(buf, "queue name")?,
            },
            CREATE_PRODUCER => Packet::CreateProducer {
                producer_id: codec::get_u64(buf, "producer id")?,
                address: codec::get_opt_string(buf, "address")?,
            },
            CLOSE_PRODUCER => Packet::CloseProducer {
                producer_id: codec::get_u64(buf, "producer id")?,
            },
            CREATE_CONSUMER => Packet::CreateConsumer {
                consumer_id: codec::get_u64(buf, "consumer id")?,
                queue: codec::get_string(buf, "queue")?,
                filter: codec::get_opt_string(buf, "filter")?,
                window_size: codec::get_i64(buf, "window size")?,
            },
            CLOSE_CONSUMER => Packet::CloseConsumer {
                consumer_id: codec::get_u64(buf, "consumer id")?,
            },
            START => Packet::Start,
            STOP => Packet::Stop,
            SEND => Packet::Send {
                producer_id: codec::get_u64(buf, "producer id")?,
                message: ServerMessage::decode(buf)?,
            },
            ACKNOWLEDGE => Packet::Acknowledge {
                consumer_id: codec::get_u64(buf, "consumer id")?,
                message_id: codec::get_u64(buf, "message id")?,
            },
            INDIVIDUAL_ACKNOWLEDGE => Packet::IndividualAcknowledge {
                consumer_id: codec::get_u64(buf, "consumer id")?,
                message_id: codec::get_u64(buf, "message id")?,
            },
            CONSUMER_CREDITS => Packet::ConsumerCredits {
                consumer_id: codec::get_u64(buf, "consumer id")?,
                credits: codec::get_i64(buf, "credits")?,
            },
            COMMIT => Packet::Commit,
            ROLLBACK => Packet::Rollback,
            CLOSE => Packet::Close,
            DELIVER => Packet::Deliver {
                consumer_id: codec::get_u64(buf, "consumer id")?,
                delivery_count: codec::get_u32(buf, "delivery count")?,
                message: Arc::new(ServerMessage::decode(buf)?),
            },
            PRODUCER_CREDITS => Packet::ProducerCredits {
                producer_id: codec::get_u64(buf, "producer id")?,
                credits: codec::get_i64(buf, "credits")?,
            },
            RESPONSE => Packet::Response {
                success: codec::get_bool(buf, "success")?,
                error: codec::get_opt_string(buf, "error")?,
            },
            REPLICATION_PAGE_EVENT => {
                Packet::ReplicationPageEvent(ReplicationPageEvent::decode(buf)?)
            }
            other => return Err(BrokerError::Decode(format!("unknown packet type {other}"))),
        };
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut out = BytesMut::new();
        Packet::Acknowledge {
            consumer_id: 3,
            message_id: 9,
        }
        .encode_frame(&mut out)
        .unwrap();
        let full = out.clone();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(Packet::decode_frame(&mut partial).unwrap().is_none());

        let mut buf = full;
        match Packet::decode_frame(&mut buf).unwrap() {
            Some(Packet::Acknowledge {
                consumer_id: 3,
                message_id: 9,
            }) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        Packet::Commit.encode_frame(&mut buf).unwrap();
        let message = ServerMessage::new(5, "a.b", Bytes::from_static(b"hi"));
        Packet::Send {
            producer_id: 1,
            message,
        }
        .encode_frame(&mut buf)
        .unwrap();

        assert!(matches!(Packet::decode_frame(&mut buf), Ok(Some(Packet::Commit))));
        match Packet::decode_frame(&mut buf).unwrap() {
            Some(Packet::Send { producer_id, message }) => {
                assert_eq!(producer_id, 1);
                assert_eq!(message.address().as_str(), "a.b");
                assert_eq!(message.body().as_ref(), b"hi");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_type_and_oversized_length() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 1, 200][..]);
        assert!(Packet::decode_frame(&mut buf).is_err());

        let mut buf = BytesMut::from(&[0xffu8, 0xff, 0xff, 0xff][..]);
        assert!(Packet::decode_frame(&mut buf).is_err());
    }
}
