//! Wire envelope for CRDP messages and the channel id codec.
//!
//! Three envelope shapes travel over the connection:
//! - **Request** (channel → target): `{ id, method, params? }`
//! - **Response** (target → channel): `{ id, result? | error? }`
//! - **Notification** (target → everyone): `{ method, params? }`, no `id`
//!
//! Every outgoing request id `n` from channel `c` is rewritten to `n * 10 + c`, so a
//! response is routed back by arithmetic alone and may arrive in any order.

use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde::Serialize;
use serde_json::value::RawValue;

use crate::error::{MuxError, Result};

/// Channel ids are a single decimal digit of the encoded request id.
pub const MAX_CHANNELS: usize = 10;

/// Largest id the target can represent exactly (`Number.MAX_SAFE_INTEGER`).
pub const MAX_SAFE_ID: u64 = (1 << 53) - 1;

/// Stable handle of a channel inside the multiplexor, always in `0..MAX_CHANNELS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ChannelId(u8);

impl ChannelId {
    pub fn new(index: usize) -> Option<Self> {
        (index < MAX_CHANNELS).then_some(Self(index as u8))
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn encode_id(channel: ChannelId, id: u64) -> Result<u64> {
    id.checked_mul(MAX_CHANNELS as u64)
        .and_then(|scaled| scaled.checked_add(u64::from(channel.0)))
        .filter(|encoded| *encoded <= MAX_SAFE_ID)
        .ok_or_else(|| {
            MuxError::MalformedEnvelope(format!(
                "request id {id} leaves the safe integer range once encoded"
            ))
        })
}

pub fn decode_channel(encoded: u64) -> ChannelId {
    ChannelId((encoded % MAX_CHANNELS as u64) as u8)
}

pub fn decode_id(encoded: u64) -> u64 {
    encoded / MAX_CHANNELS as u64
}

/// A `<Domain>.<Event>` method name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    name: String,
    dot: usize,
}

impl Method {
    pub fn parse(name: &str) -> Result<Self> {
        match name.split_once('.') {
            Some((domain, event))
                if !domain.is_empty() && !event.is_empty() && !event.contains('.') =>
            {
                Ok(Self {
                    name: name.to_string(),
                    dot: domain.len(),
                })
            }
            _ => Err(MuxError::MalformedEnvelope(format!(
                "method {name:?} is not of the form <Domain>.<Event>"
            ))),
        }
    }

    pub fn domain(&self) -> &str {
        &self.name[..self.dot]
    }

    pub fn event(&self) -> &str {
        &self.name[self.dot + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Top-level members of an envelope in wire order, each value kept as raw JSON text.
///
/// Only `id` and `method` are ever decoded. Payloads pass through byte for byte, including
/// string escapes such as lone UTF-16 surrogates that a full parse would reject.
#[derive(Debug, Clone)]
pub struct Fields(Vec<(String, Box<RawValue>)>);

impl Fields {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| MuxError::MalformedEnvelope(format!("invalid envelope: {e}")))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    /// Last value for `key`, matching how a JSON object with duplicate keys is read.
    fn get(&self, key: &str) -> Option<&RawValue> {
        self.0
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value.as_ref())
    }

    /// Remove every occurrence of `key`, returning the last value.
    fn take(&mut self, key: &str) -> Option<Box<RawValue>> {
        let mut taken = None;
        while let Some(index) = self.0.iter().position(|(k, _)| k == key) {
            taken = Some(self.0.remove(index).1);
        }
        taken
    }

    /// Serialize as an object whose first member is `"id": id`.
    fn to_text_with_id(&self, id: u64) -> Result<String> {
        let mut text = String::with_capacity(64);
        text.push_str("{\"id\":");
        text.push_str(&id.to_string());
        for (key, value) in &self.0 {
            let key = serde_json::to_string(key)
                .map_err(|e| MuxError::MalformedEnvelope(format!("failed to serialize: {e}")))?;
            text.push(',');
            text.push_str(&key);
            text.push(':');
            text.push_str(value.get());
        }
        text.push('}');
        Ok(text)
    }
}

impl<'de> Deserialize<'de> for Fields {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct FieldsVisitor;

        impl<'de> Visitor<'de> for FieldsVisitor {
            type Value = Fields;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Fields, A::Error> {
                let mut members = Vec::with_capacity(map.size_hint().unwrap_or(4));
                while let Some((key, value)) = map.next_entry::<String, Box<RawValue>>()? {
                    members.push((key, value));
                }
                Ok(Fields(members))
            }
        }

        deserializer.deserialize_map(FieldsVisitor)
    }
}

/// A message arriving from the target, classified once at the parse boundary.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Carries an `id`: the answer to exactly one request. `fields` holds everything but the id.
    Response { id: u64, fields: Fields },
    /// No `id`, has a `method`: fanned out to every channel as the original text.
    Notification { method: Method },
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self> {
        let mut fields = Fields::parse(text)?;

        if let Some(id) = fields.take("id") {
            let id = message_id(&id)?;
            return Ok(Self::Response { id, fields });
        }

        match fields.get("method") {
            Some(raw) => {
                let name: String = serde_json::from_str(raw.get()).map_err(|_| {
                    MuxError::MalformedEnvelope(format!("method must be a string, got {raw}"))
                })?;
                Ok(Self::Notification {
                    method: Method::parse(&name)?,
                })
            }
            None => Err(MuxError::MalformedEnvelope(
                "message has neither id nor method".to_string(),
            )),
        }
    }
}

/// Re-serialize a response with its id restored to the channel-local value.
pub fn response_text(id: u64, fields: Fields) -> Result<String> {
    fields.to_text_with_id(id)
}

/// A request sent by a channel, before id rewriting.
#[derive(Debug, Clone)]
pub struct Request {
    id: u64,
    method: Option<String>,
    fields: Fields,
}

impl Request {
    pub fn parse(text: &str) -> Result<Self> {
        let mut fields = Fields::parse(text)?;
        let id = fields.take("id").ok_or(MuxError::MissingId)?;
        let id = message_id(&id)?;
        let method = fields
            .get("method")
            .and_then(|raw| serde_json::from_str::<String>(raw.get()).ok());
        Ok(Self { id, method, fields })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// Domain `D` when this request is exactly `D.enable`.
    pub fn enabled_domain(&self) -> Option<&str> {
        let (domain, event) = self.method.as_deref()?.split_once('.')?;
        (event == "enable" && !domain.is_empty()).then_some(domain)
    }

    /// Serialize with the id rewritten for `channel`.
    pub fn encode(&self, channel: ChannelId) -> Result<String> {
        let encoded = encode_id(channel, self.id)?;
        self.fields.to_text_with_id(encoded)
    }
}

fn message_id(raw: &RawValue) -> Result<u64> {
    serde_json::from_str(raw.get()).map_err(|_| {
        MuxError::MalformedEnvelope(format!("id must be a non-negative integer, got {raw}"))
    })
}
