use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// Header the agent must present on the WebSocket upgrade request.
pub const AUTH_HEADER: &str = "x-ctxlink-ide-authorization";

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_PING: &str = "ping";
pub const METHOD_AT_MENTIONED: &str = "at_mentioned";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const SERVER_NOT_INITIALIZED: i64 = -32002;

/// The literal `"2.0"` marker carried by every JSON-RPC message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion;

impl Serialize for JsonRpcVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct JsonRpcVersionVisitor;

        impl<'de> Visitor<'de> for JsonRpcVersionVisitor {
            type Value = JsonRpcVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("the jsonrpc version string \"2.0\"")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value.trim() == "2.0" {
                    Ok(JsonRpcVersion)
                } else {
                    Err(E::custom(format!("unsupported jsonrpc version '{value}'")))
                }
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                self.visit_str(&value)
            }
        }

        deserializer.deserialize_str(JsonRpcVersionVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A single JSON-RPC 2.0 message. Requests carry `id` + `method`,
/// notifications only `method`, responses `id` + `result` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcMessage {
    pub jsonrpc: JsonRpcVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Notification,
    Response,
    Invalid,
}

impl RpcMessage {
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: None,
            method: Some(method.to_string()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn response(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    /// Error response. `id` is `null` when the offending request could not be read.
    pub fn error_response(id: Option<Value>, code: i64, message: &str) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: Some(id.unwrap_or(Value::Null)),
            method: None,
            params: None,
            result: None,
            error: Some(RpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match (&self.id, &self.method) {
            (Some(_), Some(_)) => MessageKind::Request,
            (None, Some(_)) => MessageKind::Notification,
            (Some(_), None) if self.result.is_some() || self.error.is_some() => {
                MessageKind::Response
            }
            _ => MessageKind::Invalid,
        }
    }

    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or_default()
    }
}

/// Payload of the `at_mentioned` notification. Lines are zero-indexed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MentionParams {
    #[serde(rename = "filePath")]
    pub file_path: String,
    #[serde(rename = "lineStart", default, skip_serializing_if = "Option::is_none")]
    pub line_start: Option<u32>,
    #[serde(rename = "lineEnd", default, skip_serializing_if = "Option::is_none")]
    pub line_end: Option<u32>,
}

/// Result body returned for `initialize`.
pub fn initialize_result(server_name: &str, server_version: &str) -> Value {
    serde_json::json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {
            "logging": {},
            "tools": { "listChanged": false },
        },
        "serverInfo": {
            "name": server_name,
            "version": server_version,
        },
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

/// Encode one message as a WebSocket text payload.
pub fn encode_message<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    check_size(encoded.len(), max_frame_bytes)?;
    Ok(encoded)
}

/// Decode one WebSocket payload. A trailing line break is tolerated.
pub fn decode_message<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let raw = trim_line_end(bytes);
    check_size(raw.len(), max_frame_bytes)?;
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

fn check_size(size: usize, max: usize) -> Result<(), FrameError> {
    if size > max {
        return Err(FrameError::OversizedFrame { size, max });
    }
    Ok(())
}

fn trim_line_end(mut raw: &[u8]) -> &[u8] {
    while let [rest @ .., b'\n' | b'\r'] = raw {
        raw = rest;
    }
    raw
}

/// Values and errors produced by one [`LineDecoder`] call, in input order
/// within each list.
#[derive(Debug, Clone)]
pub struct DecodedLines<T> {
    pub items: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodedLines<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> DecodedLines<T> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.errors.is_empty()
    }
}

/// Incremental reader for newline-delimited JSON arriving in arbitrary chunks.
///
/// Blank lines are skipped. A line longer than the limit is reported once and
/// then discarded up to its terminating newline, so one runaway line cannot
/// swallow the lines after it.
pub struct LineDecoder<T> {
    max_line_bytes: usize,
    buf: Vec<u8>,
    // Bytes of `buf` already known to contain no newline.
    scanned: usize,
    discarding: bool,
    item: PhantomData<fn() -> T>,
}

impl<T> LineDecoder<T> {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            buf: Vec::new(),
            scanned: 0,
            discarding: false,
            item: PhantomData,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl<T> Default for LineDecoder<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<T: DeserializeOwned> LineDecoder<T> {
    pub fn feed(&mut self, chunk: &[u8]) -> DecodedLines<T> {
        let mut out = DecodedLines::default();
        self.buf.extend_from_slice(chunk);

        let mut line_start = 0;
        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let line_end = self.scanned + offset;
            if self.discarding {
                self.discarding = false;
            } else {
                decode_line(&self.buf[line_start..line_end], self.max_line_bytes, &mut out);
            }
            line_start = line_end + 1;
            self.scanned = line_start;
        }
        self.buf.drain(..line_start);
        self.scanned = self.buf.len();

        if !self.discarding && self.buf.len() > self.max_line_bytes {
            out.errors.push(FrameError::OversizedFrame {
                size: self.buf.len(),
                max: self.max_line_bytes,
            });
            self.discarding = true;
        }
        if self.discarding {
            self.buf.clear();
            self.scanned = 0;
        }
        out
    }

    /// End of input: decode an unterminated last line, if any.
    pub fn finish(&mut self) -> DecodedLines<T> {
        let mut out = DecodedLines::default();
        let tail = std::mem::take(&mut self.buf);
        self.scanned = 0;
        if !std::mem::take(&mut self.discarding) {
            decode_line(&tail, self.max_line_bytes, &mut out);
        }
        out
    }
}

fn decode_line<T: DeserializeOwned>(line: &[u8], max: usize, out: &mut DecodedLines<T>) {
    let line = trim_line_end(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return;
    }
    match decode_message(line, max) {
        Ok(item) => out.items.push(item),
        Err(err) => out.errors.push(err),
    }
}
