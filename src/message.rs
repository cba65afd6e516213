// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope Encoding
//!
//! Only `application/json` payloads are interpreted; every other content type
//! passes through as raw bytes untouched, in both directions.

use crate::errors::AmqpError;
use serde::Serialize;

/// Content type under which payloads are encoded and parsed as JSON
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Content type applied to raw payloads when the caller does not set one
pub const RAW_CONTENT_TYPE: &str = "application/octet-stream";

/// A decoded message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Raw(Vec<u8>),
}

impl Payload {
    /// Builds a JSON payload from any serializable value.
    pub fn json<T: Serialize>(value: &T) -> Result<Payload, AmqpError> {
        serde_json::to_value(value)
            .map(Payload::Json)
            .map_err(|_| AmqpError::DecodePayloadError)
    }

    /// The content type this payload is published under when the caller does
    /// not override it.
    pub fn content_type(&self) -> &'static str {
        match self {
            Payload::Json(_) => JSON_CONTENT_TYPE,
            Payload::Raw(_) => RAW_CONTENT_TYPE,
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Raw(bytes)
    }
}

/// Encodes a payload for the wire under the given content type.
pub fn encode(payload: &Payload, content_type: &str) -> Vec<u8> {
    match payload {
        Payload::Json(value) if content_type == JSON_CONTENT_TYPE => {
            serde_json::to_vec(value).unwrap_or_default()
        }
        Payload::Json(value) => value.to_string().into_bytes(),
        Payload::Raw(bytes) => bytes.clone(),
    }
}

/// Decodes wire bytes according to the declared content type.
///
/// A malformed JSON body under the JSON content type is a
/// [`AmqpError::DecodePayloadError`]; callers surface it as an error event
/// instead of delivering the message.
pub fn decode(bytes: &[u8], content_type: Option<&str>) -> Result<Payload, AmqpError> {
    if content_type == Some(JSON_CONTENT_TYPE) {
        return serde_json::from_slice(bytes)
            .map(Payload::Json)
            .map_err(|_| AmqpError::DecodePayloadError);
    }

    Ok(Payload::Raw(bytes.to_vec()))
}
