//! Captured request/response data model
//!
//! Header and parameter maps are ordered multi-maps so a record round-trips
//! through the store in the order it was observed on the wire. Response
//! headers are kept as raw bytes: origin servers emit values that are not
//! valid UTF-8, and an insert must never fail because of them.

use indexmap::IndexMap;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Ordered multi-map of textual header/parameter values
pub type FieldMap = IndexMap<String, Vec<String>>;

/// Which proxy path captured a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    /// Default origin port for this scheme
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl FromStr for Scheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(format!("unknown scheme: {other}")),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request observed by the proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedRequest {
    /// Store-assigned identity; 0 until persisted, immutable afterwards
    #[serde(default)]
    pub id: i64,

    /// HTTP method
    pub method: String,

    /// Which proxy path captured it
    pub scheme: Scheme,

    /// Authority (host[:port]) as seen by the proxy
    pub host: String,

    /// Request path without the query string
    pub path: String,

    /// Request headers in wire order
    pub headers: FieldMap,

    /// Query parameters in wire order
    pub params: FieldMap,

    /// Request body; the full serialized wire request for HTTPS captures
    pub body: String,
}

/// A response observed by the proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedResponse {
    /// Store-assigned identity; 0 until persisted
    #[serde(default)]
    pub id: i64,

    /// Identity of the request that produced this response
    pub request_id: i64,

    /// HTTP status code
    pub code: u16,

    /// Status line reason phrase
    pub message: String,

    /// Response headers; values may contain arbitrary bytes
    pub headers: RawHeaders,

    /// Response body; the full dumped wire response for HTTPS captures
    pub body: String,
}

/// A captured request joined with its response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedPair {
    pub request: CapturedRequest,
    pub response: CapturedResponse,
}

/// Ordered multi-map of header values captured off the wire
///
/// Values are raw bytes. Serialization to JSON text is strict first; when a
/// value is not valid UTF-8 the store degrades to a single-field
/// representation instead of dropping the record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawHeaders(pub IndexMap<String, Vec<Vec<u8>>>);

impl RawHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one value under `name`, preserving insertion order
    pub fn append(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        self.0.entry(name.to_string()).or_default().push(value.into());
    }

    /// First value for `name` (case-insensitive), lossily decoded
    pub fn first(&self, name: &str) -> Option<String> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, vs)| vs.first())
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<Vec<u8>>)> {
        self.0.iter()
    }

    /// Strict JSON encoding; fails when any value is not valid UTF-8
    pub fn to_json_strict(&self) -> Result<String, std::str::Utf8Error> {
        let mut map = serde_json::Map::with_capacity(self.0.len());
        for (name, values) in &self.0 {
            let mut texts = Vec::with_capacity(values.len());
            for value in values {
                texts.push(serde_json::Value::String(
                    std::str::from_utf8(value)?.to_string(),
                ));
            }
            map.insert(name.clone(), serde_json::Value::Array(texts));
        }
        Ok(serde_json::Value::Object(map).to_string())
    }

    /// Degraded single-field representation with non-ASCII bytes stripped
    pub fn degraded_text(&self) -> String {
        let mut flat = String::new();
        for (name, values) in &self.0 {
            for value in values {
                flat.push_str(name);
                flat.push_str(": ");
                flat.extend(value.iter().filter(|b| b.is_ascii()).map(|&b| b as char));
                flat.push('\n');
            }
        }
        flat
    }

    /// JSON text for storage: strict encoding, or the degraded fallback
    pub fn encode_for_storage(&self) -> String {
        match self.to_json_strict() {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!("header serialization degraded: {err}");
                serde_json::json!({ "headers": self.degraded_text() }).to_string()
            }
        }
    }

    /// Parse stored JSON text back into a header map
    ///
    /// Tolerates both the strict shape and the degraded fallback shape; a row
    /// that parses as neither comes back under a single `raw` key rather than
    /// failing the read.
    pub fn decode_stored(text: &str) -> Self {
        if let Ok(map) = serde_json::from_str::<IndexMap<String, Vec<String>>>(text) {
            let mut out = Self::new();
            for (name, values) in map {
                for value in values {
                    out.append(&name, value.into_bytes());
                }
            }
            return out;
        }
        if let Ok(map) = serde_json::from_str::<IndexMap<String, String>>(text) {
            let mut out = Self::new();
            for (name, value) in map {
                out.append(&name, value.into_bytes());
            }
            return out;
        }
        let mut out = Self::new();
        out.append("raw", text.as_bytes().to_vec());
        out
    }
}

impl From<FieldMap> for RawHeaders {
    fn from(map: FieldMap) -> Self {
        let mut out = Self::new();
        for (name, values) in map {
            for value in values {
                out.append(&name, value.into_bytes());
            }
        }
        out
    }
}

impl Serialize for RawHeaders {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, values) in &self.0 {
            let texts: Vec<String> = values
                .iter()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .collect();
            map.serialize_entry(name, &texts)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for RawHeaders {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RawHeadersVisitor;

        impl<'de> Visitor<'de> for RawHeadersVisitor {
            type Value = RawHeaders;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of header name to list of values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut out = RawHeaders::new();
                while let Some((name, values)) = access.next_entry::<String, Vec<String>>()? {
                    for value in values {
                        out.append(&name, value.into_bytes());
                    }
                }
                Ok(out)
            }
        }

        deserializer.deserialize_map(RawHeadersVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_parses_and_prints() {
        assert_eq!("http".parse::<Scheme>().unwrap(), Scheme::Http);
        assert_eq!("https".parse::<Scheme>().unwrap(), Scheme::Https);
        assert!("ftp".parse::<Scheme>().is_err());
        assert_eq!(Scheme::Https.as_str(), "https");
        assert_eq!(Scheme::Http.default_port(), 80);
    }

    #[test]
    fn strict_encoding_preserves_order_and_multiplicity() {
        let mut headers = RawHeaders::new();
        headers.append("Set-Cookie", b"a=1".to_vec());
        headers.append("Set-Cookie", b"b=2".to_vec());
        headers.append("Content-Type", b"text/html".to_vec());

        let text = headers.to_json_strict().unwrap();
        assert_eq!(
            text,
            r#"{"Set-Cookie":["a=1","b=2"],"Content-Type":["text/html"]}"#
        );

        let decoded = RawHeaders::decode_stored(&text);
        assert_eq!(decoded, headers);
    }

    #[test]
    fn first_ignores_header_name_case() {
        let mut headers = RawHeaders::new();
        headers.append("Content-Type", b"text/html".to_vec());

        assert_eq!(headers.first("content-type").unwrap(), "text/html");
        assert_eq!(headers.first("CONTENT-TYPE").unwrap(), "text/html");
        assert!(headers.first("content-length").is_none());
    }

    #[test]
    fn invalid_bytes_degrade_instead_of_failing() {
        let mut headers = RawHeaders::new();
        headers.append("X-Binary", vec![0xff, 0xfe, b'o', b'k']);

        assert!(headers.to_json_strict().is_err());

        let stored = headers.encode_for_storage();
        let value: serde_json::Value = serde_json::from_str(&stored).unwrap();
        assert_eq!(value["headers"], "X-Binary: ok\n");
    }

    #[test]
    fn degraded_rows_are_still_readable() {
        let mut headers = RawHeaders::new();
        headers.append("X-Binary", vec![0xff, b'x']);
        let stored = headers.encode_for_storage();

        let decoded = RawHeaders::decode_stored(&stored);
        assert_eq!(decoded.first("headers").unwrap(), "X-Binary: x\n");
    }

    #[test]
    fn pair_serializes_to_json() {
        let pair = CapturedPair {
            request: CapturedRequest {
                id: 1,
                method: "GET".to_string(),
                scheme: Scheme::Http,
                host: "example.com".to_string(),
                path: "/".to_string(),
                headers: FieldMap::new(),
                params: FieldMap::new(),
                body: String::new(),
            },
            response: CapturedResponse {
                id: 1,
                request_id: 1,
                code: 200,
                message: "200 OK".to_string(),
                headers: RawHeaders::new(),
                body: "hello".to_string(),
            },
        };

        let json = serde_json::to_value(&pair).unwrap();
        assert_eq!(json["request"]["scheme"], "http");
        assert_eq!(json["response"]["request_id"], 1);
    }
}
