// Copyright Exograph, Inc. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file at the root of this repository.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

pub(crate) mod action;
pub(crate) mod core;
pub(crate) mod lazy;

use async_graphql_parser::Positioned;
use async_graphql_parser::types::{Field, OperationDefinition};
use async_graphql_value::ConstValue;

use crate::error::ResolverError;
use crate::fs::Fs;
use crate::operation_printer::{Fragments, print_arguments};

/// Where the package contract lives on disk, inside action containers.
pub const SCHEMA_FILE_PATH: &str = "/dagger.graphql";
pub const REQUEST_FILE_PATH: &str = "/dagger.json";
pub const SOCKET_BRIDGE_ID: &str = "dagger-sock";
pub const SOCKET_PATH: &str = "/dagger.sock";
pub const INPUTS_MOUNT: &str = "/inputs";
pub const OUTPUTS_MOUNT: &str = "/outputs";
pub const FS_MOUNT_ROOT: &str = "/mnt";

/// The operation being executed, as resolvers see it.
pub(crate) struct OperationEnv<'a> {
    pub name: Option<&'a str>,
    /// Printed operation header (`query Name($x: T)`), empty for the
    /// anonymous-query shorthand.
    pub header: String,
    /// Request variables with operation defaults applied.
    pub variables: serde_json::Map<String, serde_json::Value>,
    pub operation: &'a Positioned<OperationDefinition>,
    pub fragments: &'a Fragments,
}

/// Intermediate result of one field resolver. The executor's values are
/// polymorphic over concrete results and suspended subtrees.
pub(crate) enum Resolved {
    /// Plain data; selected children resolve by key lookup.
    Value(serde_json::Value),
    /// A filesystem handle, serialized at output time.
    Fs(Fs),
    /// Namespace marker; children resolve through their own bindings.
    Object,
    /// Suspended: the executor reconstitutes the selection subtree as
    /// recipes.
    Lazy,
}

/// One step of the resolution path from the operation root to the current
/// field: enough to re-print the chain (lazy values) and to navigate action
/// output (response keys).
#[derive(Debug, Clone)]
pub(crate) struct TrailSeg {
    pub field: String,
    pub arguments: String,
    pub output_key: String,
}

impl TrailSeg {
    pub fn from_field(field: &Positioned<Field>) -> Self {
        let name = field.node.name.node.to_string();
        let output_key = field
            .node
            .alias
            .as_ref()
            .map(|alias| alias.node.to_string())
            .unwrap_or_else(|| name.clone());
        Self {
            field: name,
            arguments: print_arguments(&field.node.arguments),
            output_key,
        }
    }
}

/// A field's arguments, coerced against the request variables into plain
/// JSON.
pub(crate) struct Arguments(serde_json::Map<String, serde_json::Value>);

pub(crate) fn coerce_arguments(
    field: &Field,
    variables: &serde_json::Map<String, serde_json::Value>,
) -> Result<Arguments, ResolverError> {
    let mut coerced = serde_json::Map::new();
    for (name, value) in &field.arguments {
        let const_value =
            value
                .node
                .clone()
                .into_const_with(|variable| match variables.get(variable.as_str()) {
                    Some(value) => ConstValue::from_json(value.clone()).map_err(|error| {
                        ResolverError::InvalidArgument(format!(
                            "variable `${}`: {error}",
                            variable.as_str()
                        ))
                    }),
                    None => Err(ResolverError::InvalidArgument(format!(
                        "variable `${}` is not defined",
                        variable.as_str()
                    ))),
                })?;
        let json = const_value
            .into_json()
            .map_err(|error| ResolverError::InvalidArgument(error.to_string()))?;
        coerced.insert(name.node.to_string(), json);
    }
    Ok(Arguments(coerced))
}

impl Arguments {
    pub fn raw(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.0
    }

    pub fn string(&self, name: &str) -> Result<String, ResolverError> {
        match self.0.get(name) {
            Some(serde_json::Value::String(value)) => Ok(value.clone()),
            Some(_) => Err(ResolverError::InvalidArgument(format!(
                "`{name}` is not a string"
            ))),
            None => Err(ResolverError::InvalidArgument(format!(
                "missing argument `{name}`"
            ))),
        }
    }

    pub fn opt_string(&self, name: &str) -> Result<Option<String>, ResolverError> {
        match self.0.get(name) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(value)) => Ok(Some(value.clone())),
            Some(_) => Err(ResolverError::InvalidArgument(format!(
                "`{name}` is not a string"
            ))),
        }
    }

    pub fn string_list(&self, name: &str) -> Result<Vec<String>, ResolverError> {
        let items = match self.0.get(name) {
            Some(serde_json::Value::Array(items)) => items,
            Some(_) => {
                return Err(ResolverError::InvalidArgument(format!(
                    "`{name}` is not a list"
                )));
            }
            None => {
                return Err(ResolverError::InvalidArgument(format!(
                    "missing argument `{name}`"
                )));
            }
        };
        items
            .iter()
            .map(|item| match item {
                serde_json::Value::String(value) => Ok(value.clone()),
                _ => Err(ResolverError::InvalidArgument(format!(
                    "`{name}` contains a non-string element"
                ))),
            })
            .collect()
    }

    pub fn fs(&self, name: &str) -> Result<Fs, ResolverError> {
        let value = self.0.get(name).ok_or_else(|| {
            ResolverError::InvalidArgument(format!("missing argument `{name}`"))
        })?;
        Ok(Fs::parse_value(value)?)
    }
}
