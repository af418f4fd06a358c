//! Notification payload decoding.
//!
//! Provides:
//! - Payload types advertised to the FHIR server (`NONE`, `XML`, `JSON`)
//! - Encoding sniffing on the raw notification body
//! - Decoding into a generic [`Resource`] representation

pub mod xml;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error type for payload decoding.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid XML payload: {0}")]
    Xml(String),

    #[error("Payload is not UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),

    #[error("Payload does not describe a FHIR resource: missing resource type")]
    MissingResourceType,
}

/// Expected encoding of notification payloads for a subscription.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum PayloadType {
    /// Notifications carry no resource (ping only).
    #[default]
    None,
    /// Notifications carry the resource as FHIR XML.
    Xml,
    /// Notifications carry the resource as FHIR JSON.
    Json,
}

impl PayloadType {
    /// Canonical MIME type advertised when registering with the backend.
    pub fn mime_type(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Xml => Some("application/fhir+xml"),
            Self::Json => Some("application/fhir+json"),
        }
    }

    /// Name used when building composite keys.
    pub fn key_name(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Xml => "XML",
            Self::Json => "JSON",
        }
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key_name())
    }
}

/// Encoding detected on an inbound payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Json,
    Xml,
}

impl Encoding {
    /// Sniff the encoding of a raw payload.
    ///
    /// A body whose first non-whitespace character is `{` is JSON; any other
    /// non-blank body is treated as XML. Blank bodies have no encoding.
    pub fn sniff(raw: &str) -> Option<Self> {
        match raw.trim_start().chars().next() {
            None => None,
            Some('{') => Some(Self::Json),
            Some(_) => Some(Self::Xml),
        }
    }
}

/// A decoded FHIR resource.
///
/// The content keeps the JSON shape of the resource. XML payloads are
/// converted to the same shape (see [`xml`]), so consumers do not need to
/// care which encoding the server used.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    /// FHIR resource type, e.g. `Patient`.
    pub resource_type: String,
    /// Logical id, when the payload carries one.
    pub id: Option<String>,
    /// Encoding the resource arrived in.
    pub encoding: Encoding,
    /// Resource content in JSON form, including `resourceType`.
    pub content: Value,
}

impl Resource {
    /// Look up a top-level element of the resource.
    pub fn get(&self, element: &str) -> Option<&Value> {
        self.content.get(element)
    }

    fn from_content(encoding: Encoding, content: Value) -> Result<Self, PayloadError> {
        let resource_type = content
            .get("resourceType")
            .and_then(Value::as_str)
            .ok_or(PayloadError::MissingResourceType)?
            .to_string();
        let id = content.get("id").and_then(Value::as_str).map(str::to_string);

        Ok(Self {
            resource_type,
            id,
            encoding,
            content,
        })
    }
}

/// Decode a raw notification body.
///
/// Returns `Ok(None)` for an empty or blank body, which is a valid
/// notification without content.
pub fn decode_payload(raw: &str) -> Result<Option<Resource>, PayloadError> {
    let Some(encoding) = Encoding::sniff(raw) else {
        return Ok(None);
    };
    let body = raw.trim();

    let content = match encoding {
        Encoding::Json => serde_json::from_str::<Value>(body)?,
        Encoding::Xml => xml::to_json(body)?,
    };

    Resource::from_content(encoding, content).map(Some)
}
