// Copyright Exograph, Inc. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file at the root of this repository.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The `FS` scalar.
//!
//! An [`Fs`] is either a build-graph definition ready for the backend, or a
//! query that produces one when executed, or both at once: the query is the
//! recipe and the definition is its cached product after forcing. Clients see
//! neither; to them the scalar is an opaque base64 string.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use async_graphql_value::ConstValue;
use kiln_buildgraph::{Definition, State};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FsError {
    #[error("filesystem handle has neither a definition nor a query")]
    Empty,

    #[error("filesystem handle is not materialized")]
    NotMaterialized,

    #[error("invalid filesystem handle encoding: {0}")]
    Decode(String),
}

/// A GraphQL request as carried on the wire (inside an [`Fs`] and to package
/// entrypoints). Empty fields are omitted; some servers reject
/// `"operationName": ""`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub variables: serde_json::Map<String, serde_json::Value>,

    #[serde(
        default,
        rename = "operationName",
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pb: Option<Definition>,

    #[serde(flatten)]
    pub request: WireRequest,
}

impl Fs {
    pub fn from_definition(pb: Definition) -> Self {
        Self {
            pb: Some(pb),
            request: WireRequest::default(),
        }
    }

    pub fn from_request(request: WireRequest) -> Self {
        Self { pb: None, request }
    }

    pub fn is_empty(&self) -> bool {
        self.pb.is_none() && self.request.query.is_empty()
    }

    pub fn is_materialized(&self) -> bool {
        self.pb.is_some()
    }

    /// base64 of the JSON record `{pb, query, variables, operationName}`.
    pub fn serialize(&self) -> Result<String, FsError> {
        if self.is_empty() {
            return Err(FsError::Empty);
        }
        let json = serde_json::to_vec(self).map_err(|e| FsError::Decode(e.to_string()))?;
        Ok(BASE64.encode(json))
    }

    pub fn parse_str(encoded: &str) -> Result<Self, FsError> {
        let json = BASE64
            .decode(encoded.trim())
            .map_err(|e| FsError::Decode(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| FsError::Decode(e.to_string()))
    }

    /// Value coercion: strings are parsed as serialized handles; anything
    /// else is rejected.
    pub fn parse_value(value: &serde_json::Value) -> Result<Self, FsError> {
        match value {
            serde_json::Value::String(encoded) => Self::parse_str(encoded),
            other => Err(FsError::Decode(format!(
                "expected a serialized filesystem handle, got {other}"
            ))),
        }
    }

    /// Literal coercion. Malformed input is a typed error, never a panic.
    pub fn parse_literal(value: &ConstValue) -> Result<Self, FsError> {
        match value {
            ConstValue::String(encoded) => Self::parse_str(encoded),
            other => Err(FsError::Decode(format!(
                "expected a string literal, got {other}"
            ))),
        }
    }

    /// Re-enter the materialized definition as a build-graph state.
    pub fn to_state(&self) -> Result<State, FsError> {
        match &self.pb {
            Some(pb) => Ok(State::from_definition(pb.clone())),
            None => Err(FsError::NotMaterialized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use kiln_buildgraph::Platform;

    fn materialized() -> Fs {
        let def = State::image("alpine:3.18")
            .marshal(Some(&Platform::new("linux", "amd64")))
            .unwrap();
        Fs::from_definition(def)
    }

    fn unevaluated() -> Fs {
        Fs::from_request(WireRequest {
            query: r#"{ core { image(ref: "alpine:3.18") { fs } } }"#.into(),
            variables: serde_json::Map::new(),
            operation_name: None,
        })
    }

    #[test]
    fn round_trip_materialized() {
        let fs = materialized();
        let parsed = Fs::parse_str(&fs.serialize().unwrap()).unwrap();
        assert_eq!(parsed, fs);
    }

    #[test]
    fn round_trip_unevaluated() {
        let fs = unevaluated();
        let parsed = Fs::parse_str(&fs.serialize().unwrap()).unwrap();
        assert_eq!(parsed, fs);
    }

    #[test]
    fn round_trip_both_forms() {
        let fs = Fs {
            pb: materialized().pb,
            request: unevaluated().request,
        };
        let parsed = Fs::parse_str(&fs.serialize().unwrap()).unwrap();
        assert_eq!(parsed, fs);
    }

    #[test]
    fn empty_handle_does_not_serialize() {
        assert_eq!(Fs::default().serialize(), Err(FsError::Empty));
    }

    #[test]
    fn empty_fields_are_omitted_from_the_record() {
        let encoded = materialized().serialize().unwrap();
        let json = BASE64.decode(encoded).unwrap();
        let record: serde_json::Value = serde_json::from_slice(&json).unwrap();
        let object = record.as_object().unwrap();
        assert!(object.contains_key("pb"));
        assert!(!object.contains_key("query"));
        assert!(!object.contains_key("variables"));
        assert!(!object.contains_key("operationName"));
    }

    #[test]
    fn malformed_base64_is_a_decode_error() {
        assert!(matches!(
            Fs::parse_str("not base64!!"),
            Err(FsError::Decode(_))
        ));
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        let encoded = BASE64.encode(b"{ not json");
        assert!(matches!(Fs::parse_str(&encoded), Err(FsError::Decode(_))));
    }

    #[test]
    fn literal_coercion_rejects_non_strings() {
        assert!(matches!(
            Fs::parse_literal(&ConstValue::Number(7.into())),
            Err(FsError::Decode(_))
        ));
    }

    #[test]
    fn to_state_requires_materialization() {
        assert_eq!(unevaluated().to_state().unwrap_err(), FsError::NotMaterialized);
        assert!(materialized().to_state().is_ok());
    }
}
