//! Message schema shared by the worker and the process manager.
//!
//! * Request: `{"type": "<kind>", "id": <n>, ...params}`
//! * Result:  `{"type": "<kind>:result", "id": <n>, "data": <any>}`
//! * Error:   `{"type": "<kind>:error", "id": <n>, "error": {"message", "stack", "kind"}}`
//!
//! Byte buffers travel as `{"type": "Buffer", "data": [<u8>, ...]}`. Encoding and
//! decoding of buffers size their storage up front so no reallocation leaves a stray copy
//! of the plaintext behind.

use crate::buffer::PlaintextBuffer;
use crate::error::{Result, SecretError};
use crate::transport::Frame;
use serde::de::{self, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

const RESULT_SUFFIX: &str = ":result";
const ERROR_SUFFIX: &str = ":error";
const BUFFER_TAG: &str = "Buffer";

/// Request types the worker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    GenerateKeyPair,
    CheckProtectedMemoryEnabled,
    ReadInSecret,
    VerifyAllocation,
    GetDecryptedSecret,
}

impl RequestKind {
    pub const ALL: [RequestKind; 5] = [
        RequestKind::GenerateKeyPair,
        RequestKind::CheckProtectedMemoryEnabled,
        RequestKind::ReadInSecret,
        RequestKind::VerifyAllocation,
        RequestKind::GetDecryptedSecret,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::GenerateKeyPair => "generateKeyPair",
            RequestKind::CheckProtectedMemoryEnabled => "checkProtectedMemoryEnabled",
            RequestKind::ReadInSecret => "readInSecret",
            RequestKind::VerifyAllocation => "verifyAllocation",
            RequestKind::GetDecryptedSecret => "getDecryptedSecret",
        }
    }
}

impl FromStr for RequestKind {
    type Err = SecretError;

    fn from_str(s: &str) -> Result<Self> {
        RequestKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| SecretError::Validation(format!("unsupported request type: {:?}", s)))
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload carried by `<kind>:error` responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl From<&SecretError> for WireError {
    fn from(err: &SecretError) -> Self {
        Self {
            message: err.message(),
            stack: Some(err.stack()),
            kind: Some(err.kind().as_str().to_string()),
        }
    }
}

impl From<WireError> for SecretError {
    fn from(err: WireError) -> Self {
        SecretError::from_wire(err.kind.as_deref(), err.message)
    }
}

// ---------------------------------------------------------------------------
// Requests

#[derive(Serialize)]
struct RequestFrame<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    id: u64,
    #[serde(flatten)]
    params: &'a Map<String, Value>,
}

/// Serializes a request. `params` must be a JSON object (or null) without `type`/`id` keys.
pub fn encode_request(kind: RequestKind, id: u64, params: &Value) -> Result<Frame> {
    let empty = Map::new();
    let params = match params {
        Value::Null => &empty,
        Value::Object(map) => map,
        other => {
            return Err(SecretError::Validation(format!(
                "request parameters must be an object, got {}",
                other
            )))
        }
    };
    if params.contains_key("type") || params.contains_key("id") {
        return Err(SecretError::Validation(
            "request parameters may not override \"type\" or \"id\"".into(),
        ));
    }
    let frame = serde_json::to_vec(&RequestFrame {
        kind: kind.as_str(),
        id,
        params,
    })?;
    Ok(Zeroizing::new(frame))
}

/// A request as received by the worker.
#[derive(Debug, Deserialize)]
pub struct IncomingRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: u64,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

pub fn decode_request(frame: &[u8]) -> Result<IncomingRequest> {
    Ok(serde_json::from_slice(frame)?)
}

// ---------------------------------------------------------------------------
// Responses

/// Payload of a successful response.
#[derive(Debug)]
pub enum ResponseData {
    /// The response carried no `data` field.
    Empty,
    Json(Value),
    Bytes(PlaintextBuffer),
}

impl ResponseData {
    /// Reads a boolean field out of a JSON object payload.
    pub fn flag(&self, field: &str) -> Result<bool> {
        match self {
            ResponseData::Json(Value::Object(map)) => map
                .get(field)
                .and_then(Value::as_bool)
                .ok_or_else(|| {
                    SecretError::Transport(format!("response is missing boolean {:?}", field))
                }),
            _ => Err(SecretError::Transport(format!(
                "expected an object carrying {:?}",
                field
            ))),
        }
    }
}

/// What a worker sends back on success.
pub enum ResultPayload<'a> {
    None,
    Json(Value),
    Buffer(&'a PlaintextBuffer),
}

#[derive(Serialize)]
struct ResultFrame<D: Serialize> {
    #[serde(rename = "type")]
    kind: String,
    id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<D>,
}

#[derive(Serialize)]
struct ErrorFrame<'a> {
    #[serde(rename = "type")]
    kind: String,
    id: u64,
    error: &'a WireError,
}

struct WireBuffer<'a>(&'a [u8]);

impl Serialize for WireBuffer<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct(BUFFER_TAG, 2)?;
        state.serialize_field("type", BUFFER_TAG)?;
        state.serialize_field("data", self.0)?;
        state.end()
    }
}

// Fixed JSON text around a buffer result: `{"type":"`, `","id":`, the
// `,"data":{"type":"Buffer","data":[` opener and the closing `]}}`.
const BUFFER_FRAME_OVERHEAD: usize = 9 + 7 + 33 + 3;
const MAX_ID_DIGITS: usize = 20;

/// Upper bound on the encoded size of a buffer result, so the frame is never
/// reallocated while it holds plaintext. Each byte renders as at most `255,`.
fn buffer_frame_capacity(kind: &str, len: usize) -> usize {
    BUFFER_FRAME_OVERHEAD + kind.len() + MAX_ID_DIGITS + len * 4
}

/// Serializes a `<kind>:result` response.
pub fn encode_result(kind: &str, id: u64, payload: ResultPayload<'_>) -> Result<Frame> {
    let kind = format!("{}{}", kind, RESULT_SUFFIX);
    match payload {
        ResultPayload::None => Ok(Zeroizing::new(serde_json::to_vec(&ResultFrame::<Value> {
            kind,
            id,
            data: None,
        })?)),
        ResultPayload::Json(value) => Ok(Zeroizing::new(serde_json::to_vec(&ResultFrame {
            kind,
            id,
            data: Some(value),
        })?)),
        ResultPayload::Buffer(buffer) => buffer.with_bytes(|bytes| -> Result<Frame> {
            let mut frame = Zeroizing::new(Vec::with_capacity(buffer_frame_capacity(
                &kind,
                bytes.len(),
            )));
            serde_json::to_writer(
                &mut *frame,
                &ResultFrame {
                    kind,
                    id,
                    data: Some(WireBuffer(bytes)),
                },
            )?;
            Ok(frame)
        })?,
    }
}

/// Serializes a `<kind>:error` response.
pub fn encode_error(kind: &str, id: u64, error: &SecretError) -> Result<Frame> {
    let wire = WireError::from(error);
    let frame = serde_json::to_vec(&ErrorFrame {
        kind: format!("{}{}", kind, ERROR_SUFFIX),
        id,
        error: &wire,
    })?;
    Ok(Zeroizing::new(frame))
}

/// How a response settles its request.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Result,
    Error,
}

/// A response as received by the manager, borrowing from its frame.
#[derive(Debug, Deserialize)]
pub struct Envelope<'a> {
    #[serde(rename = "type", borrow)]
    pub kind: Cow<'a, str>,
    pub id: u64,
    #[serde(borrow, default)]
    pub data: Option<&'a RawValue>,
    #[serde(default)]
    pub error: Option<WireError>,
}

impl Envelope<'_> {
    /// Splits `"<kind>:result"` / `"<kind>:error"` into the request kind and outcome.
    pub fn outcome(&self) -> Option<(&str, Outcome)> {
        if let Some(base) = self.kind.strip_suffix(RESULT_SUFFIX) {
            Some((base, Outcome::Result))
        } else {
            self.kind
                .strip_suffix(ERROR_SUFFIX)
                .map(|base| (base, Outcome::Error))
        }
    }

    /// Rebuilds the result payload, turning serialized buffers back into bytes.
    pub fn decode_data(&self) -> Result<ResponseData> {
        match self.data {
            None => Ok(ResponseData::Empty),
            Some(raw) if is_wire_buffer(raw)? => decode_buffer(raw).map(ResponseData::Bytes),
            Some(raw) => Ok(ResponseData::Json(serde_json::from_str(raw.get())?)),
        }
    }

    /// The error carried by an `:error` response, or a transport error if it is missing.
    pub fn into_error(self) -> SecretError {
        match self.error {
            Some(wire) => wire.into(),
            None => SecretError::Transport(format!(
                "error response {} carried no error payload",
                self.id
            )),
        }
    }
}

pub fn decode_envelope(frame: &[u8]) -> Result<Envelope<'_>> {
    Ok(serde_json::from_slice(frame)?)
}

#[derive(Deserialize)]
struct Tag<'a> {
    #[serde(rename = "type", borrow, default)]
    kind: Option<Cow<'a, str>>,
}

fn is_wire_buffer(raw: &RawValue) -> Result<bool> {
    if !raw.get().trim_start().starts_with('{') {
        return Ok(false);
    }
    let tag: Tag<'_> = serde_json::from_str(raw.get())?;
    Ok(tag.kind.as_deref() == Some(BUFFER_TAG))
}

fn decode_buffer(raw: &RawValue) -> Result<PlaintextBuffer> {
    // n bytes need at least 2n - 1 characters.
    let capacity = raw.get().len() / 2 + 1;
    let mut de = serde_json::Deserializer::from_str(raw.get());
    let bytes = BufferSeed { capacity }.deserialize(&mut de)?;
    de.end()?;
    Ok(PlaintextBuffer::from_vec(bytes))
}

struct BufferSeed {
    capacity: usize,
}

impl<'de> DeserializeSeed<'de> for BufferSeed {
    type Value = Vec<u8>;

    fn deserialize<D: de::Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<Vec<u8>, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for BufferSeed {
    type Value = Vec<u8>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a serialized Buffer object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Vec<u8>, A::Error> {
        let mut bytes: Option<Vec<u8>> = None;
        while let Some(key) = map.next_key::<String>()? {
            if key == "data" {
                bytes = Some(map.next_value_seed(ByteSeq {
                    capacity: self.capacity,
                })?);
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        bytes.ok_or_else(|| de::Error::missing_field("data"))
    }
}

struct ByteSeq {
    capacity: usize,
}

impl<'de> DeserializeSeed<'de> for ByteSeq {
    type Value = Vec<u8>;

    fn deserialize<D: de::Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<Vec<u8>, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for ByteSeq {
    type Value = Vec<u8>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of bytes")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Vec<u8>, A::Error> {
        let mut out = Zeroizing::new(Vec::with_capacity(self.capacity));
        while let Some(byte) = seq.next_element::<u8>()? {
            if out.len() == out.capacity() {
                return Err(de::Error::custom("buffer payload is larger than its frame"));
            }
            out.push(byte);
        }
        Ok(std::mem::take(&mut *out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_kinds_parse_by_wire_name() {
        for kind in RequestKind::ALL {
            assert_eq!(kind.as_str().parse::<RequestKind>().expect("parse"), kind);
        }
        assert!(matches!(
            "deleteEverything".parse::<RequestKind>(),
            Err(SecretError::Validation(_))
        ));
    }

    #[test]
    fn request_params_are_flattened() {
        let frame = encode_request(
            RequestKind::ReadInSecret,
            7,
            &json!({"promptString": "Password: "}),
        )
        .expect("encode");
        let value: Value = serde_json::from_slice(&frame).expect("json");
        assert_eq!(value, json!({"type": "readInSecret", "id": 7, "promptString": "Password: "}));

        let incoming = decode_request(&frame).expect("decode");
        assert_eq!(incoming.kind, "readInSecret");
        assert_eq!(incoming.id, 7);
        assert_eq!(incoming.params.get("promptString"), Some(&json!("Password: ")));
    }

    #[test]
    fn request_params_must_be_an_object() {
        assert!(matches!(
            encode_request(RequestKind::GenerateKeyPair, 1, &json!([1, 2])),
            Err(SecretError::Validation(_))
        ));
        assert!(matches!(
            encode_request(RequestKind::GenerateKeyPair, 1, &json!({"id": 99})),
            Err(SecretError::Validation(_))
        ));
        let frame =
            encode_request(RequestKind::GenerateKeyPair, 1, &Value::Null).expect("null params");
        assert_eq!(&frame[..], br#"{"type":"generateKeyPair","id":1}"#);
    }

    #[test]
    fn buffer_results_use_the_tagged_shape() {
        let buffer = PlaintextBuffer::from_vec(vec![0, 127, 255]);
        let frame =
            encode_result("getDecryptedSecret", 3, ResultPayload::Buffer(&buffer)).expect("encode");
        let expected = [
            br#"{"type":"getDecryptedSecret:result","id":3,"#.as_slice(),
            br#""data":{"type":"Buffer","data":[0,127,255]}}"#.as_slice(),
        ]
        .concat();
        assert_eq!(&frame[..], expected.as_slice());

        let envelope = decode_envelope(&frame).expect("envelope");
        assert_eq!(envelope.outcome(), Some(("getDecryptedSecret", Outcome::Result)));
        match envelope.decode_data().expect("data") {
            ResponseData::Bytes(bytes) => assert_eq!(bytes.raw_snapshot(), vec![0, 127, 255]),
            other => panic!("expected bytes, got {:?}", other),
        }
    }

    #[test]
    fn largest_buffer_result_fits_its_reservation() {
        let kind = format!("getDecryptedSecret{}", RESULT_SUFFIX);
        for len in [0, 1, 32, 4096] {
            let buffer = PlaintextBuffer::from_vec(vec![255; len]);
            let payload = ResultPayload::Buffer(&buffer);
            let frame = encode_result("getDecryptedSecret", u64::MAX, payload).expect("encode");
            let reserved = buffer_frame_capacity(&kind, len);
            assert!(frame.len() <= reserved, "{} > {} for {} bytes", frame.len(), reserved, len);
            assert!(frame.capacity() >= frame.len());
            assert_eq!(frame.capacity(), Vec::<u8>::with_capacity(reserved).capacity());
        }
    }

    #[test]
    fn json_and_empty_results_decode() {
        let frame = encode_result(
            "verifyAllocation",
            4,
            ResultPayload::Json(json!({"allocationVerified": true})),
        )
        .expect("encode");
        let envelope = decode_envelope(&frame).expect("envelope");
        assert!(envelope.decode_data().expect("data").flag("allocationVerified").expect("flag"));

        let frame = encode_result("readInSecret", 5, ResultPayload::None).expect("encode");
        assert_eq!(&frame[..], br#"{"type":"readInSecret:result","id":5}"#);
        let envelope = decode_envelope(&frame).expect("envelope");
        assert!(matches!(envelope.decode_data().expect("data"), ResponseData::Empty));
    }

    #[test]
    fn objects_with_other_tags_stay_json() {
        let frame = br#"{"type":"x:result","id":1,"data":{"type":"Other","data":[1]}}"#;
        let envelope = decode_envelope(frame).expect("envelope");
        assert!(matches!(envelope.decode_data().expect("data"), ResponseData::Json(_)));
    }

    #[test]
    fn errors_preserve_kind_and_message() {
        let err = SecretError::Allocation("usage dropped below baseline".into());
        let frame = encode_error("verifyAllocation", 9, &err).expect("encode");
        let envelope = decode_envelope(&frame).expect("envelope");
        assert_eq!(envelope.outcome(), Some(("verifyAllocation", Outcome::Error)));
        let rebuilt = envelope.into_error();
        assert!(matches!(
            rebuilt,
            SecretError::Allocation(ref m) if m == "usage dropped below baseline"
        ));
    }

    #[test]
    fn malformed_buffers_are_transport_errors() {
        let frame = [
            br#"{"type":"getDecryptedSecret:result","id":1,"#.as_slice(),
            br#""data":{"type":"Buffer","data":[1,300]}}"#.as_slice(),
        ]
        .concat();
        let envelope = decode_envelope(&frame).expect("envelope");
        assert!(matches!(envelope.decode_data(), Err(SecretError::Transport(_))));

        let frame = br#"{"type":"getDecryptedSecret:result","id":1,"data":{"type":"Buffer"}}"#;
        let envelope = decode_envelope(frame).expect("envelope");
        assert!(matches!(envelope.decode_data(), Err(SecretError::Transport(_))));
    }

    #[test]
    fn unknown_suffix_has_no_outcome() {
        let envelope = decode_envelope(br#"{"type":"generateKeyPair","id":2}"#).expect("envelope");
        assert_eq!(envelope.outcome(), None);
    }
}
