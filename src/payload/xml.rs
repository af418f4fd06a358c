//! FHIR XML to JSON-shaped conversion.
//!
//! FHIR XML stores primitive values in a `value` attribute and repeats
//! elements for lists. The conversion keeps that structure:
//! - `<active value="true"/>` becomes `"active": "true"`
//! - repeated siblings become an array, single ones stay scalar/object
//! - an element that has both a `value` and children keeps the value under `"value"`
//! - extension `url` attributes become a `"url"` field
//! - resources nested in `contained`/`resource` elements are flattened with their
//!   `resourceType`, as in FHIR JSON
//! - the XHTML narrative `div` is kept as its raw inner markup
//!
//! Primitive values are not typed; every primitive is a JSON string.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};

use super::PayloadError;

/// Element in the middle of being converted.
struct Frame {
    name: String,
    value: Option<String>,
    object: Map<String, Value>,
}

impl Frame {
    fn open(start: &BytesStart<'_>) -> Result<Self, PayloadError> {
        let mut object = Map::new();
        if let Some(url) = attribute(start, "url")? {
            object.insert("url".to_string(), Value::String(url));
        }

        Ok(Self {
            name: local_name(start)?,
            value: attribute(start, "value")?,
            object,
        })
    }

    fn is_resource(&self) -> bool {
        self.name.starts_with(|c: char| c.is_ascii_uppercase())
    }

    /// Finish the frame and produce its JSON value.
    fn close(mut self) -> Value {
        if self.is_resource() {
            self.object
                .insert("resourceType".to_string(), Value::String(self.name));
            return Value::Object(self.object);
        }

        match self.value {
            Some(value) if self.object.is_empty() => Value::String(value),
            Some(value) => {
                self.object.insert("value".to_string(), Value::String(value));
                Value::Object(self.object)
            }
            None => Value::Object(self.object),
        }
    }
}

/// Convert a FHIR XML document into the JSON shape of the resource.
pub fn to_json(xml: &str) -> Result<Value, PayloadError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Frame> = Vec::new();

    loop {
        let event = reader.read_event().map_err(|e| xml_error(&reader, e))?;

        match event {
            Event::Start(start) => {
                let frame = Frame::open(&start)?;

                if frame.name == "div" && !stack.is_empty() {
                    let span = reader
                        .read_to_end(start.name())
                        .map_err(|e| xml_error(&reader, e))?;
                    let begin = usize::try_from(span.start).unwrap_or(0);
                    let end = usize::try_from(span.end).unwrap_or(begin);
                    let inner = xml.get(begin..end).unwrap_or_default().trim().to_string();
                    attach(&mut stack, frame.name, Value::String(inner));
                    continue;
                }

                stack.push(frame);
            }
            Event::Empty(start) => {
                let frame = Frame::open(&start)?;
                if stack.is_empty() {
                    return Ok(frame.close());
                }
                let name = frame.name.clone();
                attach(&mut stack, name, frame.close());
            }
            Event::End(_) => {
                let Some(frame) = stack.pop() else {
                    return Err(PayloadError::Xml("unbalanced end tag".to_string()));
                };
                let name = frame.name.clone();
                let value = frame.close();
                if stack.is_empty() {
                    return Ok(value);
                }
                attach(&mut stack, name, value);
            }
            Event::Eof => {
                return Err(PayloadError::Xml(
                    "document ended before the root element was closed".to_string(),
                ));
            }
            // Declarations, comments, processing instructions and stray text
            // carry nothing for the resource.
            _ => {}
        }
    }
}

/// Attach a finished child to the frame on top of the stack.
fn attach(stack: &mut [Frame], name: String, value: Value) {
    let Some(parent) = stack.last_mut() else {
        return;
    };

    // A nested resource replaces its wrapper element, the way FHIR JSON
    // renders `contained` and `Bundle.entry.resource`.
    if name.starts_with(|c: char| c.is_ascii_uppercase()) {
        if let Value::Object(fields) = value {
            for (key, field) in fields {
                append(&mut parent.object, key, field);
            }
        }
        return;
    }

    append(&mut parent.object, name, value);
}

fn append(object: &mut Map<String, Value>, name: String, value: Value) {
    match object.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            object.insert(name, value);
        }
    }
}

fn local_name(start: &BytesStart<'_>) -> Result<String, PayloadError> {
    let name = start.local_name();
    std::str::from_utf8(name.as_ref())
        .map(str::to_string)
        .map_err(|e| PayloadError::Xml(format!("element name is not UTF-8: {e}")))
}

fn attribute(start: &BytesStart<'_>, key: &str) -> Result<Option<String>, PayloadError> {
    let attribute = start
        .try_get_attribute(key)
        .map_err(|e| PayloadError::Xml(e.to_string()))?;

    attribute
        .map(|attr| {
            attr.unescape_value()
                .map(|v| v.into_owned())
                .map_err(|e| PayloadError::Xml(e.to_string()))
        })
        .transpose()
}

fn xml_error(reader: &Reader<&[u8]>, err: quick_xml::Error) -> PayloadError {
    PayloadError::Xml(format!(
        "{err} at position {}",
        reader.error_position()
    ))
}
