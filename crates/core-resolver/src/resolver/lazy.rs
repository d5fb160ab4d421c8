// Copyright Exograph, Inc. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file at the root of this repository.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Suspended subtrees.
//!
//! When a suspendable resolver runs without the force flag, the executor
//! renders its selection subtree as recipes: every leaf becomes a serialized
//! [`Fs`] whose query is the pruned path from the operation root down to that
//! leaf. Re-executing such a query under a forcing context yields a
//! single-branch result ending in the materialized handle.

use async_graphql_parser::types::SelectionSet;

use crate::error::ResolverError;
use crate::fs::{Fs, WireRequest};
use crate::operation_printer::flatten_selection_set;

use super::{OperationEnv, TrailSeg};

pub(crate) fn materialize(
    env: &OperationEnv<'_>,
    trail: &[TrailSeg],
    selection_set: &SelectionSet,
) -> Result<serde_json::Value, ResolverError> {
    let fields = flatten_selection_set(selection_set, env.fragments)?;

    // no sub-selection: the suspended field is itself the handle
    if fields.is_empty() {
        return Ok(serde_json::Value::String(suspended(env, trail)?.serialize()?));
    }

    let mut out = serde_json::Map::new();
    for field in fields {
        let seg = TrailSeg::from_field(field);
        let output_key = seg.output_key.clone();
        let mut chain = trail.to_vec();
        chain.push(seg);
        let value = materialize(env, &chain, &field.node.selection_set.node)?;
        out.insert(output_key, value);
    }
    Ok(serde_json::Value::Object(out))
}

/// The recipe for one leaf: the ancestor chain re-printed as a query.
fn suspended(env: &OperationEnv<'_>, trail: &[TrailSeg]) -> Result<Fs, ResolverError> {
    let mut query = String::new();
    if !env.header.is_empty() {
        query.push_str(&env.header);
        query.push(' ');
    }
    for seg in trail {
        query.push_str("{ ");
        query.push_str(&seg.field);
        query.push_str(&seg.arguments);
        query.push(' ');
    }
    for _ in trail {
        query.push_str("} ");
    }
    let query = query.trim_end().to_string();

    Ok(Fs::from_request(WireRequest {
        query,
        variables: env.variables.clone(),
        operation_name: env.name.map(str::to_string),
    }))
}
