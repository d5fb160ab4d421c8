// Copyright Exograph, Inc. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file at the root of this repository.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Turning executable-document slices back into query text.
//!
//! Lazy values and action dispatch both ship AST slices across a process
//! boundary as plain GraphQL, so the engine needs the inverse of parsing.
//! Fragment spreads are spliced inline while printing; the receiving side
//! gets a self-contained operation.

use std::collections::HashMap;

use async_graphql_parser::Positioned;
use async_graphql_parser::types::{
    Field, FragmentDefinition, OperationType, Selection, SelectionSet, VariableDefinition,
};
use async_graphql_value::Name;

use crate::error::ResolverError;

pub(crate) type Fragments = HashMap<Name, Positioned<FragmentDefinition>>;

const MAX_DEPTH: usize = 64;

/// `query Name($x: T = d)` / `mutation` / empty for the anonymous-query
/// shorthand.
pub(crate) fn operation_header(
    ty: OperationType,
    name: Option<&str>,
    variable_definitions: &[Positioned<VariableDefinition>],
) -> String {
    let variables = if variable_definitions.is_empty() {
        String::new()
    } else {
        let definitions = variable_definitions
            .iter()
            .map(|definition| {
                let definition = &definition.node;
                let default = definition
                    .default_value
                    .as_ref()
                    .map(|value| format!(" = {}", value.node))
                    .unwrap_or_default();
                format!(
                    "${}: {}{}",
                    definition.name.node.as_str(),
                    definition.var_type.node,
                    default
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("({definitions})")
    };

    if ty == OperationType::Query && name.is_none() && variables.is_empty() {
        return String::new();
    }

    let keyword = match ty {
        OperationType::Query => "query",
        OperationType::Mutation => "mutation",
        OperationType::Subscription => "subscription",
    };
    let name = name.map(|n| format!(" {n}")).unwrap_or_default();
    format!("{keyword}{name}{variables}")
}

/// `(a: 1, b: $x)`, empty for no arguments. Values print in GraphQL literal
/// syntax, variables included.
pub(crate) fn print_arguments(
    arguments: &[(Positioned<Name>, Positioned<async_graphql_value::Value>)],
) -> String {
    if arguments.is_empty() {
        return String::new();
    }
    let arguments = arguments
        .iter()
        .map(|(name, value)| format!("{}: {}", name.node.as_str(), value.node))
        .collect::<Vec<_>>()
        .join(", ");
    format!("({arguments})")
}

/// Print an operation with the given root selection set.
pub(crate) fn print_query(
    header: &str,
    selection_set: &SelectionSet,
    fragments: &Fragments,
) -> Result<String, ResolverError> {
    let mut out = String::new();
    if !header.is_empty() {
        out.push_str(header);
        out.push(' ');
    }
    print_selection_set(&mut out, selection_set, fragments, 0)?;
    Ok(out)
}

fn print_selection_set(
    out: &mut String,
    selection_set: &SelectionSet,
    fragments: &Fragments,
    depth: usize,
) -> Result<(), ResolverError> {
    if depth > MAX_DEPTH {
        return Err(ResolverError::InvalidQuery("query is too deep".to_string()));
    }
    out.push('{');
    for selection in &selection_set.items {
        print_selection(out, &selection.node, fragments, depth)?;
    }
    out.push_str(" }");
    Ok(())
}

fn print_selection(
    out: &mut String,
    selection: &Selection,
    fragments: &Fragments,
    depth: usize,
) -> Result<(), ResolverError> {
    match selection {
        Selection::Field(field) => {
            let field = &field.node;
            out.push(' ');
            if let Some(alias) = &field.alias {
                out.push_str(alias.node.as_str());
                out.push_str(": ");
            }
            out.push_str(field.name.node.as_str());
            out.push_str(&print_arguments(&field.arguments));
            if !field.selection_set.node.items.is_empty() {
                out.push(' ');
                print_selection_set(out, &field.selection_set.node, fragments, depth + 1)?;
            }
            Ok(())
        }
        Selection::FragmentSpread(spread) => {
            let name = &spread.node.fragment_name.node;
            let fragment = fragments.get(name).ok_or_else(|| {
                ResolverError::InvalidQuery(format!("unknown fragment `{}`", name.as_str()))
            })?;
            for selection in &fragment.node.selection_set.node.items {
                print_selection(out, &selection.node, fragments, depth + 1)?;
            }
            Ok(())
        }
        Selection::InlineFragment(inline) => {
            for selection in &inline.node.selection_set.node.items {
                print_selection(out, &selection.node, fragments, depth + 1)?;
            }
            Ok(())
        }
    }
}

/// Resolve a selection set to its fields, splicing fragment spreads and
/// inline fragments.
pub(crate) fn flatten_selection_set<'a>(
    selection_set: &'a SelectionSet,
    fragments: &'a Fragments,
) -> Result<Vec<&'a Positioned<Field>>, ResolverError> {
    let mut fields = Vec::new();
    collect_fields(selection_set, fragments, 0, &mut fields)?;
    Ok(fields)
}

fn collect_fields<'a>(
    selection_set: &'a SelectionSet,
    fragments: &'a Fragments,
    depth: usize,
    fields: &mut Vec<&'a Positioned<Field>>,
) -> Result<(), ResolverError> {
    if depth > MAX_DEPTH {
        return Err(ResolverError::InvalidQuery(
            "fragments are nested too deeply".to_string(),
        ));
    }
    for selection in &selection_set.items {
        match &selection.node {
            Selection::Field(field) => fields.push(field),
            Selection::FragmentSpread(spread) => {
                let name = &spread.node.fragment_name.node;
                let fragment = fragments.get(name).ok_or_else(|| {
                    ResolverError::InvalidQuery(format!("unknown fragment `{}`", name.as_str()))
                })?;
                collect_fields(&fragment.node.selection_set.node, fragments, depth + 1, fields)?;
            }
            Selection::InlineFragment(inline) => {
                collect_fields(&inline.node.selection_set.node, fragments, depth + 1, fields)?;
            }
        }
    }
    Ok(())
}
