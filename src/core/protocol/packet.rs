//! Packet codec: framed JSON text messages with START / CHUNK / END
//! semantics.
//!
//! The codec is a pure function pair (`Packet::encode` / `Packet::decode`)
//! with no I/O. Decoding never panics and never surfaces an error to the
//! poll loop as exceptional: the clipboard may hold arbitrary user text at
//! any moment, so rejection is ordinary and is reported as a typed
//! [`DecodeError`] with a reason.
//!
//! Leniency rules (for robustness against older peers):
//! - a missing time field defaults to the current wall time
//! - a malformed time field is logged and replaced with the current wall
//!   time rather than failing the packet
//! - manifest `mod_time` accepts both ISO-8601 strings and epoch-millis
//!   numbers

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::core::protocol::manifest::ManifestEntry;
use crate::core::task::TransferType;
use crate::utils::time::now_millis;

/// Wire timestamp format (UTC): `yyyy-MM-dd'T'HH:mm:ss'Z'`.
pub const WIRE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Render epoch millis in the wire time format.
pub fn format_wire_time(millis: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis as i64)
        .unwrap_or_else(Utc::now)
        .format(WIRE_TIME_FORMAT)
        .to_string()
}

/// Parse a wire timestamp back to epoch millis.
pub fn parse_wire_time(text: &str) -> Option<u64> {
    let parsed = NaiveDateTime::parse_from_str(text, WIRE_TIME_FORMAT).ok()?;
    let millis = parsed.and_utc().timestamp_millis();
    (millis >= 0).then_some(millis as u64)
}

// ── Rejection ────────────────────────────────────────────────────────────────

/// Why a clipboard sample was rejected by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The text is not even brace-framed JSON; rejected before parsing.
    NotJson,
    /// Brace-framed but unparseable.
    Malformed(String),
    /// `type` is present but not START / CHUNK / END.
    UnknownPacketType(String),
    MissingField(&'static str),
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::NotJson => write!(f, "not a JSON object"),
            DecodeError::Malformed(e) => write!(f, "malformed JSON: {e}"),
            DecodeError::UnknownPacketType(t) => write!(f, "unknown packet type: {t}"),
            DecodeError::MissingField(field) => write!(f, "missing field: {field}"),
            DecodeError::InvalidField { field, reason } => {
                write!(f, "invalid field {field}: {reason}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

// ── Packet variants ──────────────────────────────────────────────────────────

/// Opens a transfer: identity, geometry, whole-file digest and, for folder
/// transfers, the archive manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct StartPacket {
    pub file_id: String,
    pub file_name: String,
    pub transfer_type: TransferType,
    pub total_size: u64,
    pub chunk_size: u32,
    pub chunk_total: u32,
    pub file_md5: String,
    /// Epoch millis; serialized as `start_time`.
    pub timestamp: u64,
    pub folder_manifest: Vec<ManifestEntry>,
}

/// One slice of the payload, Base64-wrapped, with its own digest.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPacket {
    pub file_id: String,
    pub chunk_index: u32,
    pub chunk_total: u32,
    pub chunk_md5: String,
    pub data: String,
    /// Epoch millis; serialized as `send_time`.
    pub timestamp: u64,
}

/// Closes a transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct EndPacket {
    pub file_id: String,
    pub file_name: String,
    pub chunk_total: u32,
    /// Epoch millis; serialized as `end_time`.
    pub timestamp: u64,
}

/// A protocol message, dispatched by its `type` tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Start(StartPacket),
    Chunk(ChunkPacket),
    End(EndPacket),
}

impl Packet {
    pub fn file_id(&self) -> &str {
        match self {
            Packet::Start(p) => &p.file_id,
            Packet::Chunk(p) => &p.file_id,
            Packet::End(p) => &p.file_id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Packet::Start(_) => "START",
            Packet::Chunk(_) => "CHUNK",
            Packet::End(_) => "END",
        }
    }

    /// Serialize to the wire text.
    pub fn encode(&self) -> String {
        let json = match self {
            Packet::Start(p) => p.to_json(),
            Packet::Chunk(p) => p.to_json(),
            Packet::End(p) => p.to_json(),
        };
        json.to_string()
    }

    /// Parse and validate wire text.
    ///
    /// The brace check runs before any JSON work so that ordinary clipboard
    /// text is dismissed as cheaply as possible.
    pub fn decode(text: &str) -> Result<Packet, DecodeError> {
        let trimmed = text.trim();
        if !trimmed.starts_with('{') || !trimmed.ends_with('}') {
            return Err(DecodeError::NotJson);
        }

        let value: Value =
            serde_json::from_str(trimmed).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        match str_field(&value, "type")? {
            "START" => decode_start(&value).map(Packet::Start),
            "CHUNK" => decode_chunk(&value).map(Packet::Chunk),
            "END" => decode_end(&value).map(Packet::End),
            other => Err(DecodeError::UnknownPacketType(other.to_string())),
        }
    }
}

impl StartPacket {
    fn to_json(&self) -> Value {
        let mut json = serde_json::json!({
            "type": "START",
            "file_id": self.file_id,
            "file_name": self.file_name,
            "transfer_type": self.transfer_type.as_wire(),
            "total_size": self.total_size,
            "chunk_size": self.chunk_size,
            "chunk_total": self.chunk_total,
            "file_md5": self.file_md5,
            "start_time": format_wire_time(self.timestamp),
        });
        if !self.folder_manifest.is_empty() {
            json["folder_manifest"] = Value::Array(
                self.folder_manifest
                    .iter()
                    .map(|entry| {
                        serde_json::json!({
                            "path": entry.path,
                            "mod_time": format_wire_time(entry.mod_time),
                        })
                    })
                    .collect(),
            );
        }
        json
    }
}

impl ChunkPacket {
    fn to_json(&self) -> Value {
        serde_json::json!({
            "type": "CHUNK",
            "file_id": self.file_id,
            "chunk_index": self.chunk_index,
            "chunk_total": self.chunk_total,
            "chunk_md5": self.chunk_md5,
            "data": self.data,
            "send_time": format_wire_time(self.timestamp),
        })
    }
}

impl EndPacket {
    fn to_json(&self) -> Value {
        serde_json::json!({
            "type": "END",
            "file_id": self.file_id,
            "file_name": self.file_name,
            "chunk_total": self.chunk_total,
            "end_time": format_wire_time(self.timestamp),
        })
    }
}

// ── Variant decoding ─────────────────────────────────────────────────────────

fn decode_start(value: &Value) -> Result<StartPacket, DecodeError> {
    let file_id = nonempty_str_field(value, "file_id")?;
    let file_name = nonempty_str_field(value, "file_name")?;

    let transfer_type_raw = str_field(value, "transfer_type")?;
    let transfer_type = TransferType::from_wire(transfer_type_raw).ok_or_else(|| {
        DecodeError::InvalidField {
            field: "transfer_type",
            reason: format!("expected FILE or FOLDER, got {transfer_type_raw}"),
        }
    })?;

    let total_size = positive_u64_field(value, "total_size")?;
    let chunk_size = positive_u32_field(value, "chunk_size")?;
    let chunk_total = positive_u32_field(value, "chunk_total")?;

    let expected_chunks = total_size.div_ceil(chunk_size as u64);
    if chunk_total as u64 != expected_chunks {
        return Err(DecodeError::InvalidField {
            field: "chunk_total",
            reason: format!(
                "expected {expected_chunks} for {total_size} bytes in {chunk_size}-byte chunks, got {chunk_total}"
            ),
        });
    }

    let file_md5 = md5_field(value, "file_md5")?;
    let timestamp = time_field(value, "start_time");
    let folder_manifest = decode_manifest(value)?;

    Ok(StartPacket {
        file_id,
        file_name,
        transfer_type,
        total_size,
        chunk_size,
        chunk_total,
        file_md5,
        timestamp,
        folder_manifest,
    })
}

fn decode_chunk(value: &Value) -> Result<ChunkPacket, DecodeError> {
    let file_id = nonempty_str_field(value, "file_id")?;
    let chunk_total = positive_u32_field(value, "chunk_total")?;

    let chunk_index = u64_field(value, "chunk_index")?;
    if chunk_index >= chunk_total as u64 {
        return Err(DecodeError::InvalidField {
            field: "chunk_index",
            reason: format!("index {chunk_index} out of range for {chunk_total} chunks"),
        });
    }

    let chunk_md5 = md5_field(value, "chunk_md5")?;
    let data = nonempty_str_field(value, "data")?;
    let timestamp = time_field(value, "send_time");

    Ok(ChunkPacket {
        file_id,
        chunk_index: chunk_index as u32,
        chunk_total,
        chunk_md5,
        data,
        timestamp,
    })
}

fn decode_end(value: &Value) -> Result<EndPacket, DecodeError> {
    Ok(EndPacket {
        file_id: nonempty_str_field(value, "file_id")?,
        file_name: nonempty_str_field(value, "file_name")?,
        chunk_total: positive_u32_field(value, "chunk_total")?,
        timestamp: time_field(value, "end_time"),
    })
}

fn decode_manifest(value: &Value) -> Result<Vec<ManifestEntry>, DecodeError> {
    let Some(raw) = value.get("folder_manifest") else {
        return Ok(Vec::new());
    };
    let entries = raw.as_array().ok_or(DecodeError::InvalidField {
        field: "folder_manifest",
        reason: "expected an array".to_string(),
    })?;

    let mut manifest = Vec::with_capacity(entries.len());
    for entry in entries {
        let path = nonempty_str_field(entry, "path").map_err(|_| DecodeError::InvalidField {
            field: "folder_manifest",
            reason: "entry missing path".to_string(),
        })?;
        let mod_time = match entry.get("mod_time") {
            Some(Value::String(s)) => parse_wire_time(s).unwrap_or_else(|| {
                warn!(
                    event = "manifest_time_unparseable",
                    value = %s,
                    "Unparseable manifest mod_time, using current time"
                );
                now_millis()
            }),
            Some(Value::Number(n)) => n.as_u64().unwrap_or_else(now_millis),
            _ => now_millis(),
        };
        manifest.push(ManifestEntry { path, mod_time });
    }
    Ok(manifest)
}

// ── Field helpers ────────────────────────────────────────────────────────────

fn str_field<'a>(value: &'a Value, field: &'static str) -> Result<&'a str, DecodeError> {
    value
        .get(field)
        .ok_or(DecodeError::MissingField(field))?
        .as_str()
        .ok_or(DecodeError::InvalidField {
            field,
            reason: "expected a string".to_string(),
        })
}

fn nonempty_str_field(value: &Value, field: &'static str) -> Result<String, DecodeError> {
    let raw = str_field(value, field)?;
    if raw.trim().is_empty() {
        return Err(DecodeError::InvalidField {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(raw.to_string())
}

fn u64_field(value: &Value, field: &'static str) -> Result<u64, DecodeError> {
    value
        .get(field)
        .ok_or(DecodeError::MissingField(field))?
        .as_u64()
        .ok_or(DecodeError::InvalidField {
            field,
            reason: "expected a non-negative integer".to_string(),
        })
}

fn positive_u64_field(value: &Value, field: &'static str) -> Result<u64, DecodeError> {
    let n = u64_field(value, field)?;
    if n == 0 {
        return Err(DecodeError::InvalidField {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(n)
}

fn positive_u32_field(value: &Value, field: &'static str) -> Result<u32, DecodeError> {
    let n = positive_u64_field(value, field)?;
    u32::try_from(n).map_err(|_| DecodeError::InvalidField {
        field,
        reason: format!("{n} does not fit in 32 bits"),
    })
}

/// Digest fields must be 32 hex characters; case is accepted either way
/// because all digest comparisons are case-insensitive.
fn md5_field(value: &Value, field: &'static str) -> Result<String, DecodeError> {
    let raw = nonempty_str_field(value, field)?;
    if raw.len() != 32 || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DecodeError::InvalidField {
            field,
            reason: "expected 32 hex characters".to_string(),
        });
    }
    Ok(raw)
}

/// Lenient time extraction: missing or malformed values become "now".
fn time_field(value: &Value, field: &'static str) -> u64 {
    match value.get(field).and_then(Value::as_str) {
        Some(text) => parse_wire_time(text).unwrap_or_else(|| {
            warn!(
                event = "packet_time_unparseable",
                field,
                value = %text,
                "Unparseable packet time, using current time"
            );
            now_millis()
        }),
        None => now_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Whole-second timestamp so encode → decode is lossless.
    fn ts() -> u64 {
        (now_millis() / 1000) * 1000
    }

    fn sample_start() -> StartPacket {
        StartPacket {
            file_id: "3e0c9bde-5c18-4f0f-9f52-88d06bd5ccd4".to_string(),
            file_name: "report.pdf".to_string(),
            transfer_type: TransferType::File,
            total_size: 1200,
            chunk_size: 512,
            chunk_total: 3,
            file_md5: "900150983cd24fb0d6963f7d28e17f72".to_string(),
            timestamp: ts(),
            folder_manifest: Vec::new(),
        }
    }

    #[test]
    fn test_start_round_trip() {
        let packet = Packet::Start(sample_start());
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_start_round_trip_with_manifest() {
        let mut start = sample_start();
        start.transfer_type = TransferType::Folder;
        start.file_name = "photos.zip".to_string();
        start.folder_manifest = vec![
            ManifestEntry::new("a.txt", (ts() / 1000) * 1000),
            ManifestEntry::new("sub/b.bin", (ts() / 1000) * 1000),
        ];
        let packet = Packet::Start(start);
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_chunk_round_trip() {
        let packet = Packet::Chunk(ChunkPacket {
            file_id: "id-1".to_string(),
            chunk_index: 2,
            chunk_total: 3,
            chunk_md5: "900150983cd24fb0d6963f7d28e17f72".to_string(),
            data: "aGVsbG8=".to_string(),
            timestamp: ts(),
        });
        assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_end_round_trip() {
        let packet = Packet::End(EndPacket {
            file_id: "id-1".to_string(),
            file_name: "report.pdf".to_string(),
            chunk_total: 3,
            timestamp: ts(),
        });
        assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_plain_text_rejected_before_parsing() {
        assert_eq!(Packet::decode("just some notes"), Err(DecodeError::NotJson));
        assert_eq!(Packet::decode(""), Err(DecodeError::NotJson));
        assert_eq!(Packet::decode("{unclosed"), Err(DecodeError::NotJson));
        assert!(matches!(
            Packet::decode("{not valid json}"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert_eq!(
            Packet::decode(r#"{"type":"PING","file_id":"x"}"#),
            Err(DecodeError::UnknownPacketType("PING".to_string()))
        );
    }

    #[test]
    fn test_missing_fields_rejected() {
        assert_eq!(
            Packet::decode(r#"{"file_id":"x"}"#),
            Err(DecodeError::MissingField("type"))
        );
        assert_eq!(
            Packet::decode(r#"{"type":"END","file_name":"a","chunk_total":1}"#),
            Err(DecodeError::MissingField("file_id"))
        );
    }

    #[test]
    fn test_chunk_index_out_of_range_rejected() {
        let text = r#"{"type":"CHUNK","file_id":"x","chunk_index":3,"chunk_total":3,
            "chunk_md5":"900150983cd24fb0d6963f7d28e17f72","data":"QQ=="}"#;
        assert!(matches!(
            Packet::decode(text),
            Err(DecodeError::InvalidField { field: "chunk_index", .. })
        ));
    }

    #[test]
    fn test_chunk_total_must_match_geometry() {
        let mut start = sample_start();
        start.chunk_total = 4;
        assert!(matches!(
            Packet::decode(&Packet::Start(start).encode()),
            Err(DecodeError::InvalidField { field: "chunk_total", .. })
        ));
    }

    #[test]
    fn test_missing_time_defaults_to_now() {
        let text = r#"{"type":"END","file_id":"x","file_name":"a","chunk_total":1}"#;
        let before = now_millis();
        let Packet::End(end) = Packet::decode(text).unwrap() else {
            panic!("expected END");
        };
        assert!(end.timestamp >= before);
    }

    #[test]
    fn test_malformed_time_replaced_not_fatal() {
        let text = r#"{"type":"END","file_id":"x","file_name":"a","chunk_total":1,
            "end_time":"yesterday-ish"}"#;
        assert!(Packet::decode(text).is_ok());
    }

    #[test]
    fn test_manifest_mod_time_accepts_number() {
        let text = r#"{"type":"START","file_id":"x","file_name":"d.zip",
            "transfer_type":"FOLDER","total_size":100,"chunk_size":512,"chunk_total":1,
            "file_md5":"900150983cd24fb0d6963f7d28e17f72",
            "folder_manifest":[{"path":"a.txt","mod_time":1752800000000}]}"#;
        let Packet::Start(start) = Packet::decode(text).unwrap() else {
            panic!("expected START");
        };
        assert_eq!(start.folder_manifest[0].mod_time, 1752800000000);
    }

    #[test]
    fn test_md5_accepts_uppercase() {
        let text = r#"{"type":"CHUNK","file_id":"x","chunk_index":0,"chunk_total":1,
            "chunk_md5":"900150983CD24FB0D6963F7D28E17F72","data":"QQ=="}"#;
        assert!(Packet::decode(text).is_ok());
    }

    #[test]
    fn test_wire_time_round_trip() {
        let formatted = format_wire_time(1752800000000);
        assert_eq!(parse_wire_time(&formatted), Some(1752800000000));
        assert!(parse_wire_time("not a time").is_none());
    }
}
