// Copyright Exograph, Inc. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file at the root of this repository.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The top-level resolver.
//!
//! Owns the process-wide state (package table, live-schema pointer,
//! memoization maps) and drives execution: parse, select the operation,
//! capture a schema snapshot, and walk selection sets dispatching field
//! bindings. A query in flight keeps its snapshot, so schema reloads are
//! atomic from its point of view.

use std::sync::Arc;

use async_graphql_parser::types::{
    DocumentOperations, ExecutableDocument, Field, OperationDefinition, OperationType,
    SelectionSet,
};
use async_graphql_parser::{Positioned, parse_query};
use async_recursion::async_recursion;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{error, instrument};

use crate::cache_map::CacheMap;
use crate::error::ResolverError;
use crate::fs::{Fs, FsError, WireRequest};
use crate::operation_printer::{flatten_selection_set, operation_header};
use crate::request_context::RequestContext;
use crate::resolver::{OperationEnv, Resolved, TrailSeg, action, core, lazy};
use crate::schema::{FieldBinding, LiveSchema, Package, SchemaError, core_package};

pub struct SystemResolver {
    packages: RwLock<BTreeMap<String, Package>>,
    schema: RwLock<Arc<LiveSchema>>,
    pub(crate) image_cache: CacheMap<String, Fs, ResolverError>,
    pub(crate) dockerfile_cache: CacheMap<String, Fs, ResolverError>,
    pub(crate) action_cache: CacheMap<String, serde_json::Value, ResolverError>,
}

impl SystemResolver {
    pub fn new() -> Result<Self, SchemaError> {
        let mut packages = BTreeMap::new();
        let core = core_package();
        packages.insert(core.name.clone(), core);
        let schema = Arc::new(LiveSchema::assemble(&packages)?);

        Ok(Self {
            packages: RwLock::new(packages),
            schema: RwLock::new(schema),
            image_cache: CacheMap::new(),
            dockerfile_cache: CacheMap::new(),
            action_cache: CacheMap::new(),
        })
    }

    /// The current schema snapshot. Queries capture it once at the start and
    /// never observe a partially stitched state.
    pub fn schema(&self) -> Arc<LiveSchema> {
        self.schema.read().clone()
    }

    pub(crate) fn has_package(&self, name: &str) -> bool {
        self.packages.read().contains_key(name)
    }

    pub(crate) fn package_fs(&self, name: &str) -> Option<Fs> {
        self.packages.read().get(name).map(|package| package.fs.clone())
    }

    /// Add a package and swap in the re-derived schema. A merge failure
    /// rolls the table back, so a conflicting import leaves no trace.
    pub(crate) fn install_package(&self, package: Package) -> Result<(), ResolverError> {
        let new_schema = {
            let mut packages = self.packages.write();
            if packages.contains_key(&package.name) {
                return Err(ResolverError::NameInUse(package.name));
            }
            let name = package.name.clone();
            packages.insert(name.clone(), package);
            match LiveSchema::assemble(&packages) {
                Ok(schema) => Arc::new(schema),
                Err(schema_error) => {
                    packages.remove(&name);
                    return Err(schema_error.into());
                }
            }
        };
        *self.schema.write() = new_schema;
        Ok(())
    }

    /// Execute one request against the live schema and return its data.
    #[instrument(name = "SystemResolver::execute", skip_all)]
    pub async fn execute(
        &self,
        request: &WireRequest,
        ctx: &RequestContext,
    ) -> Result<serde_json::Value, ResolverError> {
        let document = parse_query(&request.query).map_err(|parse_error| {
            error!(%parse_error, "failed to parse query");
            ResolverError::InvalidQuery(parse_error.to_string())
        })?;
        let (name, operation) = select_operation(&document, request.operation_name.as_deref())?;

        let root_type = match operation.node.ty {
            OperationType::Query => "Query",
            OperationType::Mutation => "Mutation",
            OperationType::Subscription => {
                return Err(ResolverError::InvalidQuery(
                    "subscriptions are not supported".to_string(),
                ));
            }
        };

        let env = OperationEnv {
            name,
            header: operation_header(operation.node.ty, name, &operation.node.variable_definitions),
            variables: effective_variables(request, operation)?,
            operation,
            fragments: &document.fragments,
        };

        let schema = self.schema();
        let data = self
            .resolve_selection_set(
                &schema,
                &env,
                root_type,
                &operation.node.selection_set.node,
                None,
                &[],
                ctx,
            )
            .await?;
        Ok(serde_json::Value::Object(data))
    }

    /// Force a handle to its materialized form: a materialized handle is
    /// returned as-is; an unevaluated one has its embedded request
    /// re-executed under a forcing context, and the result's materialized
    /// form is adopted alongside the original recipe.
    pub async fn force_fs(&self, fs: &Fs, ctx: &RequestContext) -> Result<Fs, ResolverError> {
        if fs.is_materialized() {
            return Ok(fs.clone());
        }
        if fs.request.query.is_empty() {
            return Err(FsError::Empty.into());
        }

        let data = self.execute(&fs.request, &ctx.forced()).await?;
        let leaf = descend_single_branch(&data)?;
        let materialized = Fs::parse_value(leaf)?;
        match materialized.pb {
            Some(pb) => Ok(Fs {
                pb: Some(pb),
                request: fs.request.clone(),
            }),
            None => Err(FsError::NotMaterialized.into()),
        }
    }

    #[async_recursion]
    #[allow(clippy::too_many_arguments)]
    async fn resolve_selection_set(
        &self,
        schema: &Arc<LiveSchema>,
        env: &OperationEnv<'_>,
        type_name: &str,
        selection_set: &SelectionSet,
        source: Option<&serde_json::Value>,
        trail: &[TrailSeg],
        ctx: &RequestContext,
    ) -> Result<serde_json::Map<String, serde_json::Value>, ResolverError> {
        let fields = flatten_selection_set(selection_set, env.fragments)?;

        let mut data = serde_json::Map::new();
        for field in fields {
            let field_name = field.node.name.node.as_str();
            let seg = TrailSeg::from_field(field);
            let output_key = seg.output_key.clone();

            if field_name == "__typename" {
                data.insert(output_key, serde_json::Value::String(type_name.to_string()));
                continue;
            }
            if !schema.has_field(type_name, field_name) {
                return Err(ResolverError::InvalidQuery(format!(
                    "unknown field `{type_name}.{field_name}`"
                )));
            }

            let mut chain = trail.to_vec();
            chain.push(seg);

            let resolved = match schema.binding(type_name, field_name) {
                Some(FieldBinding::Passthrough) => Resolved::Object,
                Some(FieldBinding::Core(kind)) => {
                    core::resolve_core_field(self, *kind, field, env, ctx).await?
                }
                Some(FieldBinding::CoreMutation(kind)) => {
                    core::resolve_core_mutation(self, *kind, field, env, ctx).await?
                }
                Some(FieldBinding::Action { package, action }) => {
                    action::resolve_action(self, package, action, field, env, &chain, ctx).await?
                }
                None => match source {
                    Some(serde_json::Value::Object(map)) => Resolved::Value(
                        map.get(field_name).cloned().unwrap_or(serde_json::Value::Null),
                    ),
                    _ => Resolved::Value(serde_json::Value::Null),
                },
            };

            let value = self
                .render(
                    schema,
                    env,
                    field,
                    schema.field_type(type_name, field_name),
                    resolved,
                    &chain,
                    ctx,
                )
                .await?;
            data.insert(output_key, value);
        }
        Ok(data)
    }

    #[async_recursion]
    #[allow(clippy::too_many_arguments)]
    async fn render(
        &self,
        schema: &Arc<LiveSchema>,
        env: &OperationEnv<'_>,
        field: &Positioned<Field>,
        return_type: Option<&str>,
        resolved: Resolved,
        trail: &[TrailSeg],
        ctx: &RequestContext,
    ) -> Result<serde_json::Value, ResolverError> {
        let selection_set = &field.node.selection_set.node;
        match resolved {
            Resolved::Lazy => lazy::materialize(env, trail, selection_set),
            Resolved::Fs(fs) => {
                if !selection_set.items.is_empty() {
                    return Err(ResolverError::InvalidQuery(format!(
                        "field `{}` is a scalar and takes no selection",
                        field.node.name.node.as_str()
                    )));
                }
                Ok(serde_json::Value::String(fs.serialize()?))
            }
            Resolved::Object => {
                let type_name = return_type.ok_or_else(|| {
                    ResolverError::InvalidQuery(format!(
                        "unknown return type of `{}`",
                        field.node.name.node.as_str()
                    ))
                })?;
                if selection_set.items.is_empty() {
                    return Err(ResolverError::InvalidQuery(format!(
                        "field `{}` requires a selection",
                        field.node.name.node.as_str()
                    )));
                }
                let data = self
                    .resolve_selection_set(schema, env, type_name, selection_set, None, trail, ctx)
                    .await?;
                Ok(serde_json::Value::Object(data))
            }
            Resolved::Value(value) => {
                self.render_value(schema, env, field, return_type, value, trail, ctx)
                    .await
            }
        }
    }

    #[async_recursion]
    #[allow(clippy::too_many_arguments)]
    async fn render_value(
        &self,
        schema: &Arc<LiveSchema>,
        env: &OperationEnv<'_>,
        field: &Positioned<Field>,
        return_type: Option<&str>,
        value: serde_json::Value,
        trail: &[TrailSeg],
        ctx: &RequestContext,
    ) -> Result<serde_json::Value, ResolverError> {
        let selection_set = &field.node.selection_set.node;
        if selection_set.items.is_empty() {
            return Ok(value);
        }
        match value {
            serde_json::Value::Null => Ok(serde_json::Value::Null),
            serde_json::Value::Array(items) => {
                let mut rendered = Vec::with_capacity(items.len());
                for item in items {
                    rendered.push(
                        self.render_value(schema, env, field, return_type, item, trail, ctx)
                            .await?,
                    );
                }
                Ok(serde_json::Value::Array(rendered))
            }
            object @ serde_json::Value::Object(_) => {
                let type_name = return_type.ok_or_else(|| {
                    ResolverError::InvalidQuery(format!(
                        "unknown return type of `{}`",
                        field.node.name.node.as_str()
                    ))
                })?;
                let data = self
                    .resolve_selection_set(
                        schema,
                        env,
                        type_name,
                        selection_set,
                        Some(&object),
                        trail,
                        ctx,
                    )
                    .await?;
                Ok(serde_json::Value::Object(data))
            }
            _ => Err(ResolverError::InvalidQuery(format!(
                "field `{}` is a scalar and takes no selection",
                field.node.name.node.as_str()
            ))),
        }
    }
}

fn select_operation<'a>(
    document: &'a ExecutableDocument,
    operation_name: Option<&str>,
) -> Result<(Option<&'a str>, &'a Positioned<OperationDefinition>), ResolverError> {
    match &document.operations {
        DocumentOperations::Single(operation) => Ok((None, operation)),
        DocumentOperations::Multiple(operations) => match operation_name {
            Some(wanted) => operations
                .iter()
                .find(|(name, _)| name.as_str() == wanted)
                .map(|(name, operation)| (Some(name.as_str()), operation))
                .ok_or_else(|| {
                    ResolverError::InvalidQuery(format!("unknown operation `{wanted}`"))
                }),
            None => {
                let mut operations = operations.iter();
                match (operations.next(), operations.next()) {
                    (Some((name, operation)), None) => Ok((Some(name.as_str()), operation)),
                    _ => Err(ResolverError::InvalidQuery(
                        "operation name required".to_string(),
                    )),
                }
            }
        },
    }
}

/// Request variables with the operation's defaults filled in for the ones
/// the client omitted.
fn effective_variables(
    request: &WireRequest,
    operation: &Positioned<OperationDefinition>,
) -> Result<serde_json::Map<String, serde_json::Value>, ResolverError> {
    let mut variables = request.variables.clone();
    for definition in &operation.node.variable_definitions {
        let name = definition.node.name.node.as_str();
        if variables.contains_key(name) {
            continue;
        }
        if let Some(default) = &definition.node.default_value {
            let json = default
                .node
                .clone()
                .into_json()
                .map_err(|error| ResolverError::InvalidArgument(error.to_string()))?;
            variables.insert(name.to_string(), json);
        }
    }
    Ok(variables)
}

/// Walk a single-branch result (as produced by a pruned recipe query) down
/// to its leaf.
fn descend_single_branch(
    data: &serde_json::Value,
) -> Result<&serde_json::Value, ResolverError> {
    let mut current = data;
    loop {
        match current {
            serde_json::Value::Object(map) if map.len() == 1 => {
                let Some(child) = map.values().next() else {
                    return Err(FsError::Decode("empty result".to_string()).into());
                };
                current = child;
            }
            serde_json::Value::Object(_) => {
                return Err(FsError::Decode(
                    "embedded query produced an ambiguous result".to_string(),
                )
                .into());
            }
            leaf => return Ok(leaf),
        }
    }
}
