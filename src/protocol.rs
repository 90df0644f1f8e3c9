//! Forward protocol wire shapes.
//!
//! Messages are MessagePack encoded:
//!
//! - Forward: `[tag, [[time, record], ...], options?]`
//! - PackedForward (gzip): `[tag, bin(gzip(entry stream)), {"size": n, "compressed": "gzip", ...}]`
//! - Ack reply: `{"ack": chunk}`
//! - Shared-key handshake: `HELO` from the server, `PING` from the client,
//!   `PONG` from the server.
//!
//! Event times are MessagePack extension type 0 carrying big-endian
//! seconds and nanoseconds.

use std::fmt;
use std::io::Cursor;

use base64::Engine as _;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::{self, DeserializeOwned, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use uuid::Uuid;

use crate::error::ForwardError;
use crate::record::Record;

/// Extension type code for EventTime.
pub const EVENT_TIME_EXT_TYPE: i8 = 0;

/// Compression marker used in PackedForward options.
pub const GZIP: &str = "gzip";

/// Second-and-nanosecond timestamp carried on every entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventTime {
    pub seconds: u32,
    pub nanos: u32,
}

impl EventTime {
    pub fn new(seconds: u32, nanos: u32) -> Self {
        Self { seconds, nanos }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            seconds: u32::try_from(now.timestamp()).unwrap_or(0),
            nanos: now.timestamp_subsec_nanos(),
        }
    }

    fn to_bytes(self) -> [u8; 8] {
        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&self.seconds.to_be_bytes());
        data[4..].copy_from_slice(&self.nanos.to_be_bytes());
        data
    }
}

impl Serialize for EventTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let data = self.to_bytes();
        serializer.serialize_newtype_struct(
            rmp_serde::MSGPACK_EXT_STRUCT_NAME,
            &(EVENT_TIME_EXT_TYPE, RawBytes(&data)),
        )
    }
}

/// Hands out event times that never go backwards.
///
/// One clock is used per batch so entry times follow input order even if
/// the wall clock steps back mid-batch.
#[derive(Debug, Default)]
pub struct EventClock {
    last: Option<EventTime>,
}

impl EventClock {
    pub fn tick(&mut self) -> EventTime {
        let now = EventTime::now();
        let next = match self.last {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last = Some(next);
        next
    }
}

/// One `(time, record)` pair ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub time: EventTime,
    pub record: Record,
}

impl Entry {
    pub fn new(time: EventTime, record: Record) -> Self {
        Self { time, record }
    }
}

impl Serialize for Entry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.time)?;
        tuple.serialize_element(&self.record)?;
        tuple.end()
    }
}

/// How a batch is put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Forward mode, entries as a plain array
    Forward,

    /// PackedForward mode, entry stream gzip-compressed into a binary blob
    CompressedForward,
}

impl SendMode {
    pub fn from_compression(compress_gzip: bool) -> Self {
        if compress_gzip {
            SendMode::CompressedForward
        } else {
            SendMode::Forward
        }
    }
}

impl fmt::Display for SendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendMode::Forward => write!(f, "forward"),
            SendMode::CompressedForward => write!(f, "compressed_forward"),
        }
    }
}

/// Serializes as MessagePack bin rather than an array of integers.
struct RawBytes<'a>(&'a [u8]);

impl Serialize for RawBytes<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.0)
    }
}

/// Trailing option map of a forward message.
#[derive(Debug, Default)]
struct MessageOptions<'a> {
    size: Option<usize>,
    compressed: Option<&'a str>,
    chunk: Option<&'a str>,
}

impl MessageOptions<'_> {
    fn is_empty(&self) -> bool {
        self.size.is_none() && self.compressed.is_none() && self.chunk.is_none()
    }
}

impl Serialize for MessageOptions<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = [
            self.size.is_some(),
            self.compressed.is_some(),
            self.chunk.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count();

        let mut map = serializer.serialize_map(Some(len))?;
        if let Some(size) = self.size {
            map.serialize_entry("size", &size)?;
        }
        if let Some(compressed) = self.compressed {
            map.serialize_entry("compressed", compressed)?;
        }
        if let Some(chunk) = self.chunk {
            map.serialize_entry("chunk", chunk)?;
        }
        map.end()
    }
}

struct ForwardMessage<'a, P: Serialize> {
    tag: &'a str,
    payload: P,
    options: MessageOptions<'a>,
}

impl<P: Serialize> Serialize for ForwardMessage<'_, P> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let has_options = !self.options.is_empty();
        let mut tuple = serializer.serialize_tuple(if has_options { 3 } else { 2 })?;
        tuple.serialize_element(self.tag)?;
        tuple.serialize_element(&self.payload)?;
        if has_options {
            tuple.serialize_element(&self.options)?;
        }
        tuple.end()
    }
}

/// Encode a batch as one forward message.
///
/// `chunk` is set when the server must acknowledge the message.
pub fn encode_message(
    mode: SendMode,
    tag: &str,
    entries: &[Entry],
    chunk: Option<&str>,
) -> Result<Vec<u8>, ForwardError> {
    match mode {
        SendMode::Forward => {
            let message = ForwardMessage {
                tag,
                payload: entries,
                options: MessageOptions {
                    chunk,
                    ..MessageOptions::default()
                },
            };
            Ok(rmp_serde::to_vec(&message)?)
        }
        SendMode::CompressedForward => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            for entry in entries {
                rmp_serde::encode::write(&mut encoder, entry)?;
            }
            let compressed = encoder.finish()?;

            let message = ForwardMessage {
                tag,
                payload: RawBytes(&compressed),
                options: MessageOptions {
                    size: Some(entries.len()),
                    compressed: Some(GZIP),
                    chunk,
                },
            };
            Ok(rmp_serde::to_vec(&message)?)
        }
    }
}

/// New unique chunk id for ack mode.
pub fn new_chunk_id() -> String {
    base64::engine::general_purpose::STANDARD.encode(Uuid::new_v4().as_bytes())
}

/// Server acknowledgement of a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AckResponse {
    pub ack: String,
}

/// Opaque byte string that may arrive as MessagePack bin or str.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bin(pub Vec<u8>);

impl<'de> Deserialize<'de> for Bin {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_byte_buf(BinVisitor)
    }
}

struct BinVisitor;

impl<'de> Visitor<'de> for BinVisitor {
    type Value = Bin;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a byte string")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Bin, E> {
        Ok(Bin(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Bin, E> {
        Ok(Bin(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Bin, E> {
        Ok(Bin(v.as_bytes().to_vec()))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Bin, A::Error> {
        let mut bytes = Vec::new();
        while let Some(byte) = seq.next_element::<u8>()? {
            bytes.push(byte);
        }
        Ok(Bin(bytes))
    }
}

/// Options carried by the server's HELO.
#[derive(Debug, Clone, Deserialize)]
pub struct HeloOptions {
    pub nonce: Bin,

    /// Salt for user authentication; empty when disabled
    #[serde(default)]
    pub auth: Bin,

    #[serde(default = "default_keepalive")]
    pub keepalive: bool,
}

fn default_keepalive() -> bool {
    true
}

/// `["HELO", options]`
#[derive(Debug, Clone, Deserialize)]
pub struct Helo(pub String, pub HeloOptions);

/// `["PONG", auth_result, reason, server_hostname, shared_key_hexdigest]`
#[derive(Debug, Clone, Deserialize)]
pub struct Pong(pub String, pub bool, pub String, pub String, pub String);

/// Encode the client's `PING`.
///
/// User authentication is not supported, so username and password are sent empty.
pub fn encode_ping(hostname: &str, salt: &str, digest: &str) -> Result<Vec<u8>, ForwardError> {
    Ok(rmp_serde::to_vec(&("PING", hostname, salt, digest, "", ""))?)
}

/// Hex SHA-512 of `salt + hostname + nonce + shared_key`.
pub fn shared_key_digest(salt: &str, hostname: &str, nonce: &[u8], shared_key: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(salt.as_bytes());
    hasher.update(hostname.as_bytes());
    hasher.update(nonce);
    hasher.update(shared_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Random salt for the shared-key digest.
pub fn new_salt() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Try to decode one message from the front of `buf`.
///
/// Returns the value and the number of bytes it used, or `None` when
/// `buf` does not yet hold a complete message.
pub fn decode_frame<T: DeserializeOwned>(buf: &[u8]) -> Result<Option<(T, usize)>, ForwardError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(buf);
    match rmp_serde::from_read::<_, T>(&mut cursor) {
        Ok(value) => Ok(Some((value, cursor.position() as usize))),
        Err(err) if is_incomplete(&err) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn is_incomplete(err: &rmp_serde::decode::Error) -> bool {
    match err {
        rmp_serde::decode::Error::InvalidMarkerRead(e)
        | rmp_serde::decode::Error::InvalidDataRead(e) => {
            e.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}
