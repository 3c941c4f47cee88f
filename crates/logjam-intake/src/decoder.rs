// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Strict decoding of request bodies into log records.
//!
//! A body goes through three gates before it becomes a record:
//! 1. the `Content-Type` base media type must be one of the accepted JSON types (a missing header
//!    is accepted),
//! 2. the body may not exceed the configured byte ceiling, checked against `Content-Length` up
//!    front and enforced again while reading,
//! 3. the bytes must hold exactly one JSON value of the expected [`Shape`], checked against the
//!    optional [`Schema`].
//!
//! Every rejection is a [`DecodeError`] variant that maps to one status code and one client
//! message. Offsets are the number of bytes the parser had consumed when it gave up.

use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::http::{header, HeaderMap};
use hyper::StatusCode;
use serde::de::{self, DeserializeSeed, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use serde_json::error::Category;
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::record::{Batch, LogRecord};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Content-Type header is not application/json")]
    UnsupportedMediaType,

    #[error("Request body must not be larger than {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("Request body contains badly-formed JSON (at position {offset})")]
    MalformedSyntax { offset: usize },

    #[error(
        "Request body contains an invalid value for {} (at position {})",
        describe_field(.field),
        .offset
    )]
    TypeMismatch { field: String, offset: usize },

    #[error("Request body contains unknown field {name:?}")]
    UnknownField { name: String },

    #[error("Request body must not be empty")]
    EmptyBody,

    #[error("Request body must only contain a single JSON value")]
    TrailingData,

    #[error("Unable to read request body")]
    BodyRead,
}

fn describe_field(field: &str) -> String {
    if field.is_empty() {
        "the top-level value".to_string()
    } else {
        format!("the {field:?} field")
    }
}

impl DecodeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DecodeError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DecodeError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Expected JSON type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Object,
    Array,
    Any,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Bool => "bool",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
            FieldKind::Any => "any",
        };
        f.write_str(name)
    }
}

impl FromStr for FieldKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "string" => Ok(FieldKind::String),
            "number" => Ok(FieldKind::Number),
            "bool" | "boolean" => Ok(FieldKind::Bool),
            "object" => Ok(FieldKind::Object),
            "array" => Ok(FieldKind::Array),
            "any" => Ok(FieldKind::Any),
            other => Err(format!("unknown field kind '{other}'")),
        }
    }
}

/// Expected fields of a record. An empty schema is open: any key is accepted. A non-empty
/// schema is closed: strict decoding rejects keys it does not list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    fields: HashMap<String, FieldKind>,
}

impl Schema {
    pub fn open() -> Self {
        Self::default()
    }

    pub fn from_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, FieldKind)>,
        S: Into<String>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|(name, kind)| (name.into(), kind))
                .collect(),
        }
    }

    /// Parses `name:kind` pairs separated by commas or whitespace.
    pub fn from_config_str(schema: &str) -> Result<Self, String> {
        let normalized = schema.replace(',', " ");
        let mut fields = HashMap::new();

        for pair in normalized.split_whitespace() {
            let parts = pair.split(':').collect::<Vec<&str>>();
            match parts.as_slice() {
                [name, kind] if !name.is_empty() => {
                    fields.insert((*name).to_string(), kind.parse::<FieldKind>()?);
                }
                _ => return Err(format!("invalid schema entry '{pair}', expected name:kind")),
            }
        }
        Ok(Self { fields })
    }

    pub fn is_closed(&self) -> bool {
        !self.fields.is_empty()
    }

    fn kind_of(&self, field: &str) -> Option<FieldKind> {
        if self.is_closed() {
            self.fields.get(field).copied()
        } else {
            Some(FieldKind::Any)
        }
    }
}

/// Top-level shape a body must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Object,
    ArrayOfObjects,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// Unknown fields and trailing data are rejected.
    Strict,
    /// Unknown fields are kept and anything after the first value is ignored.
    Permissive,
}

impl Strictness {
    pub fn from_strict_flag(strict: bool) -> Self {
        if strict {
            Strictness::Strict
        } else {
            Strictness::Permissive
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedBody {
    Single(LogRecord),
    Batch(Batch),
}

impl DecodedBody {
    pub fn into_records(self) -> Batch {
        match self {
            DecodedBody::Single(record) => vec![record],
            DecodedBody::Batch(batch) => batch,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BodyDecoder {
    max_bytes: usize,
    accepted_media_types: Vec<String>,
    schema: Schema,
}

impl BodyDecoder {
    pub fn new(max_bytes: usize, accepted_media_types: &[String], schema: Schema) -> Self {
        Self {
            max_bytes,
            accepted_media_types: accepted_media_types
                .iter()
                .map(|media_type| media_type.trim().to_lowercase())
                .collect(),
            schema,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Full pipeline for one request: header checks, bounded read, then decoding.
    pub async fn decode<B>(
        &self,
        headers: &HeaderMap,
        body: B,
        shape: Shape,
        strictness: Strictness,
    ) -> Result<DecodedBody, DecodeError>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.verify_content_type(headers)?;
        self.verify_content_length(headers)?;
        let bytes = self.read_body(body).await?;
        self.decode_slice(&bytes, shape, strictness)
    }

    pub fn verify_content_type(&self, headers: &HeaderMap) -> Result<(), DecodeError> {
        let Some(content_type) = headers.get(header::CONTENT_TYPE) else {
            return Ok(());
        };
        let content_type = content_type
            .to_str()
            .map_err(|_| DecodeError::UnsupportedMediaType)?;
        if content_type.trim().is_empty() {
            return Ok(());
        }

        let media_type = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        if self.accepted_media_types.contains(&media_type) {
            Ok(())
        } else {
            Err(DecodeError::UnsupportedMediaType)
        }
    }

    /// Rejects a declared `Content-Length` over the ceiling before any byte is read. A missing or
    /// unparseable header is left to the bounded read.
    pub fn verify_content_length(&self, headers: &HeaderMap) -> Result<(), DecodeError> {
        let declared = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<usize>().ok());
        match declared {
            Some(length) if length > self.max_bytes => Err(DecodeError::BodyTooLarge {
                limit: self.max_bytes,
            }),
            _ => Ok(()),
        }
    }

    pub async fn read_body<B>(&self, body: B) -> Result<Bytes, DecodeError>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match Limited::new(body, self.max_bytes).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
                Err(DecodeError::BodyTooLarge {
                    limit: self.max_bytes,
                })
            }
            Err(err) => {
                debug!("Error reading request body: {err}");
                Err(DecodeError::BodyRead)
            }
        }
    }

    /// Decodes exactly one JSON value of the given shape from `body`.
    pub fn decode_slice(
        &self,
        body: &[u8],
        shape: Shape,
        strictness: Strictness,
    ) -> Result<DecodedBody, DecodeError> {
        if body.len() > self.max_bytes {
            return Err(DecodeError::BodyTooLarge {
                limit: self.max_bytes,
            });
        }
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(DecodeError::EmptyBody);
        }

        let context = DecodeContext {
            schema: &self.schema,
            strictness,
            failure: RefCell::new(None),
        };
        let mut de = serde_json::Deserializer::from_slice(body);

        let decoded = match shape {
            Shape::Object => RecordSeed {
                context: &context,
                path: String::new(),
            }
            .deserialize(&mut de)
            .map(DecodedBody::Single),
            Shape::ArrayOfObjects => BatchSeed { context: &context }
                .deserialize(&mut de)
                .map(DecodedBody::Batch),
        }
        .map_err(|err| classify(err, body, &context))?;

        if strictness == Strictness::Strict {
            de.end().map_err(|_| DecodeError::TrailingData)?;
        }
        Ok(decoded)
    }
}

/// Converts a parser error into the taxonomy. Schema and shape violations are recorded by the
/// visitors on the side, everything else is syntax.
fn classify(err: serde_json::Error, body: &[u8], context: &DecodeContext<'_>) -> DecodeError {
    let offset = byte_offset(body, err.line(), err.column());
    if let Some(failure) = context.failure.take() {
        return match failure {
            Failure::TypeMismatch(field) => DecodeError::TypeMismatch { field, offset },
            Failure::UnknownField(name) => DecodeError::UnknownField { name },
        };
    }
    match err.classify() {
        Category::Eof => DecodeError::MalformedSyntax { offset: body.len() },
        Category::Data => DecodeError::TypeMismatch {
            field: String::new(),
            offset,
        },
        Category::Syntax | Category::Io => DecodeError::MalformedSyntax { offset },
    }
}

/// serde_json reports 1-based lines and the number of bytes consumed on the current line.
fn byte_offset(body: &[u8], line: usize, column: usize) -> usize {
    if line == 0 {
        return 0;
    }
    let line_start: usize = body
        .split_inclusive(|byte| *byte == b'\n')
        .take(line - 1)
        .map(<[u8]>::len)
        .sum();
    (line_start + column).min(body.len())
}

enum Failure {
    TypeMismatch(String),
    UnknownField(String),
}

struct DecodeContext<'a> {
    schema: &'a Schema,
    strictness: Strictness,
    failure: RefCell<Option<Failure>>,
}

impl DecodeContext<'_> {
    /// Keeps the innermost failure, which is always recorded first.
    fn record(&self, failure: Failure) {
        let mut slot = self.failure.borrow_mut();
        if slot.is_none() {
            *slot = Some(failure);
        }
    }

    fn mismatch<E: de::Error>(
        &self,
        field: &str,
        unexpected: de::Unexpected<'_>,
        expected: &dyn de::Expected,
    ) -> E {
        self.record(Failure::TypeMismatch(field.to_string()));
        E::invalid_type(unexpected, expected)
    }

    fn rejects_unknown_fields(&self) -> bool {
        self.strictness == Strictness::Strict && self.schema.is_closed()
    }
}

/// Scalar visits are always a shape violation for the container visitors below.
macro_rules! reject_scalars {
    () => {
        fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
            Err(self.context.mismatch(&self.path(), de::Unexpected::Bool(v), &self))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Err(self.context.mismatch(&self.path(), de::Unexpected::Signed(v), &self))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Err(self.context.mismatch(&self.path(), de::Unexpected::Unsigned(v), &self))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
            Err(self.context.mismatch(&self.path(), de::Unexpected::Float(v), &self))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Err(self.context.mismatch(&self.path(), de::Unexpected::Str(v), &self))
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Err(self.context.mismatch(&self.path(), de::Unexpected::Unit, &self))
        }
    };
}

struct RecordSeed<'a> {
    context: &'a DecodeContext<'a>,
    path: String,
}

impl<'de> DeserializeSeed<'de> for RecordSeed<'_> {
    type Value = LogRecord;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<LogRecord, D::Error> {
        deserializer.deserialize_any(RecordVisitor {
            context: self.context,
            path: self.path,
        })
    }
}

struct RecordVisitor<'a> {
    context: &'a DecodeContext<'a>,
    /// Empty for a top-level record, `[i]` for a batch element.
    path: String,
}

impl RecordVisitor<'_> {
    fn path(&self) -> String {
        self.path.clone()
    }

    fn field_path(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.path)
        }
    }
}

impl<'de> Visitor<'de> for RecordVisitor<'_> {
    type Value = LogRecord;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON object")
    }

    reject_scalars!();

    fn visit_seq<A: SeqAccess<'de>>(self, _seq: A) -> Result<LogRecord, A::Error> {
        Err(self
            .context
            .mismatch(&self.path(), de::Unexpected::Seq, &self))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<LogRecord, A::Error> {
        let mut fields = Map::new();
        while let Some(name) = map.next_key::<String>()? {
            let kind = match self.context.schema.kind_of(&name) {
                Some(kind) => kind,
                None if self.context.rejects_unknown_fields() => {
                    self.context.record(Failure::UnknownField(name.clone()));
                    return Err(de::Error::custom(format_args!("unknown field `{name}`")));
                }
                None => FieldKind::Any,
            };
            let value = map.next_value_seed(FieldSeed {
                context: self.context,
                field: self.field_path(&name),
                kind,
            })?;
            fields.insert(name, value);
        }
        Ok(LogRecord::from(fields))
    }
}

struct FieldSeed<'a> {
    context: &'a DecodeContext<'a>,
    field: String,
    kind: FieldKind,
}

impl<'de> DeserializeSeed<'de> for FieldSeed<'_> {
    type Value = Value;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        let value = Value::deserialize(deserializer)?;
        if self.kind.matches(&value) {
            return Ok(value);
        }
        let message = format!("expected {} for field `{}`", self.kind, self.field);
        self.context.record(Failure::TypeMismatch(self.field));
        Err(de::Error::custom(message))
    }
}

struct BatchSeed<'a> {
    context: &'a DecodeContext<'a>,
}

impl<'de> DeserializeSeed<'de> for BatchSeed<'_> {
    type Value = Batch;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Batch, D::Error> {
        deserializer.deserialize_any(BatchVisitor {
            context: self.context,
        })
    }
}

struct BatchVisitor<'a> {
    context: &'a DecodeContext<'a>,
}

impl BatchVisitor<'_> {
    fn path(&self) -> String {
        String::new()
    }
}

impl<'de> Visitor<'de> for BatchVisitor<'_> {
    type Value = Batch;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON array of objects")
    }

    reject_scalars!();

    fn visit_map<A: MapAccess<'de>>(self, _map: A) -> Result<Batch, A::Error> {
        Err(self
            .context
            .mismatch(&self.path(), de::Unexpected::Map, &self))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Batch, A::Error> {
        let mut batch = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(record) = seq.next_element_seed(RecordSeed {
            context: self.context,
            path: format!("[{}]", batch.len()),
        })? {
            batch.push(record);
        }
        Ok(batch)
    }
}
