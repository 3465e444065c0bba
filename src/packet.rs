//! Wire packet format. See [`Packet`].

use std::cmp::Ordering;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{Map, Value};

use crate::{
    addr::{validate_ip, PeerAddr},
    seq::Seq,
};

/// A single RUDP wire packet.
///
/// Encodes to, and decodes from, a canonical JSON object (see [`Packet::encode`]
/// and [`Packet::decode`]). The field set is fixed; [`Packet::decode`] rejects
/// both missing required fields and unrecognised extra ones.
///
/// [`Ord`] on [`Packet`] is defined purely by [`Packet::sequence_number`] (see
/// [`Packet::cmp_by_seq`]); this is what [`crate::heap::ReorderHeap`] relies on.
/// Full structural equality (all fields) is available via the derived
/// [`PartialEq`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sequence number of this packet, in `0..2^16`.
    pub sequence_number: Seq,
    /// True destination of this packet (may differ from the datagram's
    /// physical recipient if relayed).
    pub dest_addr: PeerAddr,
    /// Address of the node that originated this packet.
    pub source_addr: PeerAddr,
    /// Opaque message payload. Possibly empty.
    pub payload: Vec<u8>,
    /// Number of further fragments completing the same logical message.
    /// `0` means this is the last (or only) fragment.
    pub more_fragments: u32,
    /// If positive, the next sequence number the sender of this packet
    /// expects to receive.
    pub ack: u32,
    /// Marks the end of a connection.
    pub fin: bool,
    /// Marks the start of a connection.
    pub syn: bool,
}

impl Packet {
    /// Compares two packets by [`Packet::sequence_number`] alone.
    ///
    /// This is the ordering [`crate::heap::ReorderHeap`] is built on; it does
    /// *not* consider any other field.
    #[must_use]
    pub fn cmp_by_seq(&self, other: &Self) -> Ordering {
        self.sequence_number.cmp(&other.sequence_number)
    }

    /// Encodes this packet as canonical JSON bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let obj = self.to_json();
        // a `Packet` only ever contains values that serialize successfully
        serde_json::to_vec(&obj).expect("packet json should always serialize")
    }

    fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert(
            "sequence_number".into(),
            Value::from(self.sequence_number.0),
        );
        obj.insert("dest_ip".into(), Value::from(self.dest_addr.ip.clone()));
        obj.insert("dest_port".into(), Value::from(self.dest_addr.port));
        obj.insert(
            "source_ip".into(),
            Value::from(self.source_addr.ip.clone()),
        );
        obj.insert("source_port".into(), Value::from(self.source_addr.port));
        obj.insert(
            "payload".into(),
            Value::from(BASE64.encode(&self.payload)),
        );
        obj.insert("more_fragments".into(), Value::from(self.more_fragments));
        obj.insert("ack".into(), Value::from(self.ack));
        obj.insert("fin".into(), Value::from(self.fin));
        obj.insert("syn".into(), Value::from(self.syn));
        Value::Object(obj)
    }

    /// Parses and validates a packet from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::MalformedFormat`] if `bytes` is not valid JSON,
    /// or [`DecodeError::InvalidStructure`] if it is valid JSON but does not
    /// satisfy the packet schema (missing/extra/mistyped/out-of-range fields).
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| DecodeError::MalformedFormat(e.to_string()))?;
        Self::from_unvalidated_json(&value)
    }

    fn from_unvalidated_json(value: &Value) -> Result<Self, DecodeError> {
        let obj = value
            .as_object()
            .ok_or_else(|| DecodeError::InvalidStructure("expected a JSON object".into()))?;

        const REQUIRED_KEYS: &[&str] = &[
            "sequence_number",
            "dest_ip",
            "dest_port",
            "source_ip",
            "source_port",
            "payload",
            "more_fragments",
            "ack",
            "fin",
            "syn",
        ];
        for &key in REQUIRED_KEYS {
            if !obj.contains_key(key) {
                return Err(DecodeError::InvalidStructure(format!(
                    "missing required field {key:?}"
                )));
            }
        }
        if let Some(extra) = obj.keys().find(|k| !REQUIRED_KEYS.contains(&k.as_str())) {
            return Err(DecodeError::InvalidStructure(format!(
                "unknown field {extra:?}"
            )));
        }

        let sequence_number = non_negative_u16(obj, "sequence_number")?;
        let dest_ip = string_field(obj, "dest_ip")?;
        let dest_port = port_field(obj, "dest_port")?;
        let source_ip = string_field(obj, "source_ip")?;
        let source_port = port_field(obj, "source_port")?;
        let payload_b64 = string_field(obj, "payload")?;
        let more_fragments = non_negative_u32(obj, "more_fragments")?;
        let ack = non_negative_u32(obj, "ack")?;
        let fin = bool_field(obj, "fin")?;
        let syn = bool_field(obj, "syn")?;

        validate_ip(&dest_ip)
            .map_err(|e| DecodeError::InvalidStructure(format!("dest_ip: {e}")))?;
        validate_ip(&source_ip)
            .map_err(|e| DecodeError::InvalidStructure(format!("source_ip: {e}")))?;

        let payload = BASE64
            .decode(payload_b64.as_bytes())
            .map_err(|_| DecodeError::InvalidStructure("payload: invalid base64".into()))?;

        Ok(Self {
            sequence_number: Seq(sequence_number),
            dest_addr: PeerAddr::new(dest_ip, dest_port),
            source_addr: PeerAddr::new(source_ip, source_port),
            payload,
            more_fragments,
            ack,
            fin,
            syn,
        })
    }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Result<String, DecodeError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| DecodeError::InvalidStructure(format!("{key}: expected a string")))
}

fn bool_field(obj: &Map<String, Value>, key: &str) -> Result<bool, DecodeError> {
    obj.get(key)
        .and_then(Value::as_bool)
        .ok_or_else(|| DecodeError::InvalidStructure(format!("{key}: expected a boolean")))
}

fn non_negative_u16(obj: &Map<String, Value>, key: &str) -> Result<u16, DecodeError> {
    let n = non_negative_integer(obj, key)?;
    u16::try_from(n).map_err(|_| DecodeError::InvalidStructure(format!("{key}: out of range")))
}

fn non_negative_u32(obj: &Map<String, Value>, key: &str) -> Result<u32, DecodeError> {
    let n = non_negative_integer(obj, key)?;
    u32::try_from(n).map_err(|_| DecodeError::InvalidStructure(format!("{key}: out of range")))
}

fn non_negative_integer(obj: &Map<String, Value>, key: &str) -> Result<u64, DecodeError> {
    let value = obj
        .get(key)
        .ok_or_else(|| DecodeError::InvalidStructure(format!("missing field {key:?}")))?;
    let n = value
        .as_u64()
        .ok_or_else(|| DecodeError::InvalidStructure(format!("{key}: expected a non-negative integer")))?;
    Ok(n)
}

fn port_field(obj: &Map<String, Value>, key: &str) -> Result<u16, DecodeError> {
    let n = non_negative_integer(obj, key)?;
    if (1..=65535).contains(&n) {
        Ok(u16::try_from(n).expect("checked range above"))
    } else {
        Err(DecodeError::InvalidStructure(format!(
            "{key}: {n} out of range 1..=65535"
        )))
    }
}

/// Error produced by [`Packet::decode`].
///
/// The two variants are deliberately distinguishable: a caller wiring up
/// logging typically wants a different message for "this wasn't JSON at
/// all" versus "this was JSON but not a valid packet".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The bytes were not valid JSON at all.
    #[error("malformed packet: {0}")]
    MalformedFormat(String),
    /// The bytes were valid JSON but violated the packet schema.
    #[error("invalid packet structure: {0}")]
    InvalidStructure(String),
}
