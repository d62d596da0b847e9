use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::address::Address;
use crate::core::error::{BrokerError, Result};
use crate::wire::codec;

// Well-known properties.
pub const PROP_GROUP_ID: &str = "_relay.group_id";
pub const PROP_SCHEDULED_DELIVERY_TIME: &str = "_relay.scheduled_delivery_time";
pub const PROP_ORIGINAL_ADDRESS: &str = "_relay.original_address";
pub const PROP_ORIGINAL_QUEUE: &str = "_relay.original_queue";
pub const PROP_ORIGINAL_MESSAGE_ID: &str = "_relay.original_message_id";
pub const PROP_ACTUAL_EXPIRY_TIME: &str = "_relay.actual_expiry";

pub const MAX_PRIORITY: u8 = 9;
pub const DEFAULT_PRIORITY: u8 = 4;

const TYPE_BOOL: u8 = 1;
const TYPE_INT: u8 = 2;
const TYPE_FLOAT: u8 = 3;
const TYPE_STRING: u8 = 4;
const TYPE_BYTES: u8 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Bytes),
}

impl PropertyValue {
    fn encode_size(&self) -> usize {
        1 + match self {
            PropertyValue::Bool(_) => 1,
            PropertyValue::Int(_) | PropertyValue::Float(_) => 8,
            PropertyValue::String(s) => 2 + s.len(),
            PropertyValue::Bytes(b) => 4 + b.len(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            PropertyValue::Bool(v) => {
                buf.put_u8(TYPE_BOOL);
                codec::put_bool(buf, *v);
            }
            PropertyValue::Int(v) => {
                buf.put_u8(TYPE_INT);
                buf.put_i64(*v);
            }
            PropertyValue::Float(v) => {
                buf.put_u8(TYPE_FLOAT);
                buf.put_f64(*v);
            }
            PropertyValue::String(v) => {
                buf.put_u8(TYPE_STRING);
                codec::put_string(buf, v)?;
            }
            PropertyValue::Bytes(v) => {
                buf.put_u8(TYPE_BYTES);
                codec::put_bytes(buf, v)?;
            }
        }
        Ok(())
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        match codec::get_u8(buf, "property type")? {
            TYPE_BOOL => Ok(PropertyValue::Bool(codec::get_bool(buf, "bool property")?)),
            TYPE_INT => Ok(PropertyValue::Int(codec::get_i64(buf, "int property")?)),
            TYPE_FLOAT => Ok(PropertyValue::Float(codec::get_f64(buf, "float property")?)),
            TYPE_STRING => Ok(PropertyValue::String(codec::get_string(
                buf,
                "string property",
            )?)),
            TYPE_BYTES => Ok(PropertyValue::Bytes(codec::get_bytes(buf, "bytes property")?)),
            other => Err(BrokerError::Decode(format!("unknown property type {other}"))),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

/// A message as held by the broker. Shared between queues behind an `Arc`;
/// only the reference counters change once it has been routed.
#[derive(Debug)]
pub struct ServerMessage {
    id: u64,
    address: Address,
    durable: bool,
    /// Absolute expiry in ms since epoch, 0 = never.
    expiration: u64,
    timestamp: u64,
    priority: u8,
    properties: BTreeMap<String, PropertyValue>,
    body: Bytes,
    ref_count: AtomicU32,
    durable_ref_count: AtomicU32,
}

impl ServerMessage {
    pub fn new(id: u64, address: impl Into<Address>, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            address: address.into(),
            durable: false,
            expiration: 0,
            timestamp: current_timestamp(),
            priority: DEFAULT_PRIORITY,
            properties: BTreeMap::new(),
            body: body.into(),
            ref_count: AtomicU32::new(0),
            durable_ref_count: AtomicU32::new(0),
        }
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_expiration(mut self, expiration: u64) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_group_id(self, group: impl Into<String>) -> Self {
        self.with_property(PROP_GROUP_ID, group.into())
    }

    pub fn with_scheduled_delivery_time(self, at_ms: u64) -> Self {
        self.with_property(PROP_SCHEDULED_DELIVERY_TIME, at_ms as i64)
    }

    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn set_address(&mut self, address: impl Into<Address>) {
        self.address = address.into();
    }

    pub fn set_expiration(&mut self, expiration: u64) {
        self.expiration = expiration;
    }

    pub fn put_property(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<PropertyValue> {
        self.properties.remove(key)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn address(&self) -> &Address {
        &self.address
    }

    #[inline]
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    #[inline]
    pub fn expiration(&self) -> u64 {
        self.expiration
    }

    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[inline]
    pub fn priority(&self) -> u8 {
        self.priority
    }

    #[inline]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    pub fn properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.properties
    }

    pub fn group_id(&self) -> Option<&str> {
        self.property(PROP_GROUP_ID).and_then(PropertyValue::as_str)
    }

    pub fn scheduled_delivery_time(&self) -> Option<u64> {
        self.property(PROP_SCHEDULED_DELIVERY_TIME)
            .and_then(PropertyValue::as_i64)
            .and_then(|v| u64::try_from(v).ok())
    }

    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiration != 0 && now_ms >= self.expiration
    }

    /// Copies the message under a new id for re-routing (expiry, dead
    /// letter, move). Reference counts start from zero.
    pub fn copy_with_id(&self, id: u64) -> ServerMessage {
        Self {
            id,
            address: self.address.clone(),
            durable: self.durable,
            expiration: self.expiration,
            timestamp: self.timestamp,
            priority: self.priority,
            properties: self.properties.clone(),
            body: self.body.clone(),
            ref_count: AtomicU32::new(0),
            durable_ref_count: AtomicU32::new(0),
        }
    }

    pub fn increment_ref_count(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn decrement_ref_count(&self) -> u32 {
        saturating_decrement(&self.ref_count)
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn increment_durable_ref_count(&self) -> u32 {
        self.durable_ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn decrement_durable_ref_count(&self) -> u32 {
        saturating_decrement(&self.durable_ref_count)
    }

    pub fn durable_ref_count(&self) -> u32 {
        self.durable_ref_count.load(Ordering::Acquire)
    }

    /// Exact number of bytes written by [`ServerMessage::encode`]; also the
    /// unit of producer and consumer credits.
    pub fn encode_size(&self) -> usize {
        let props: usize = self
            .properties
            .iter()
            .map(|(k, v)| 2 + k.len() + v.encode_size())
            .sum();
        8 + 2 + self.address.as_str().len() + 1 + 8 + 8 + 1 + 2 + props + 4 + self.body.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(self.encode_size());
        buf.put_u64(self.id);
        codec::put_string(buf, self.address.as_str())?;
        codec::put_bool(buf, self.durable);
        buf.put_u64(self.expiration);
        buf.put_u64(self.timestamp);
        buf.put_u8(self.priority);
        let count = u16::try_from(self.properties.len()).map_err(|_| {
            BrokerError::InvalidArgument("too many message properties".to_string())
        })?;
        buf.put_u16(count);
        for (key, value) in &self.properties {
            codec::put_string(buf, key)?;
            value.encode(buf)?;
        }
        codec::put_bytes(buf, &self.body)?;
        Ok(())
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        let id = codec::get_u64(buf, "message id")?;
        let address = codec::get_string(buf, "message address")?;
        let durable = codec::get_bool(buf, "durable flag")?;
        let expiration = codec::get_u64(buf, "expiration")?;
        let timestamp = codec::get_u64(buf, "timestamp")?;
        let priority = codec::get_u8(buf, "priority")?;
        let count = codec::get_u16(buf, "property count")?;
        let mut properties = BTreeMap::new();
        for _ in 0..count {
            let key = codec::get_string(buf, "property key")?;
            let value = PropertyValue::decode(buf)?;
            properties.insert(key, value);
        }
        let body = codec::get_bytes(buf, "message body")?;
        Ok(Self {
            id,
            address: Address::new(address),
            durable,
            expiration,
            timestamp,
            priority: priority.min(MAX_PRIORITY),
            properties,
            body,
            ref_count: AtomicU32::new(0),
            durable_ref_count: AtomicU32::new(0),
        })
    }
}

fn saturating_decrement(counter: &AtomicU32) -> u32 {
    match counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1)) {
        Ok(previous) => previous - 1,
        Err(_) => 0,
    }
}

pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
