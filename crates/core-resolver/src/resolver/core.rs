// Copyright Exograph, Inc. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file at the root of this repository.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Resolvers of the built-in `core` package.
//!
//! The `Core` query fields are suspendable: without the force flag they
//! return recipes. The mutations always run; the ones that consume a handle
//! force it first.

use std::collections::BTreeMap;

use async_graphql_parser::Positioned;
use async_graphql_parser::types::Field;
use serde_json::json;
use tracing::debug;

use kiln_buildgraph::gateway::{
    DOCKERFILE_FRONTEND, FRONTEND_INPUT_CONTEXT, FRONTEND_INPUT_DOCKERFILE, FRONTEND_OPT_FILENAME,
    FRONTEND_OPT_PLATFORM,
};
use kiln_buildgraph::{GatewayError, SolveRequest, State};

use crate::error::ResolverError;
use crate::fs::{Fs, FsError};
use crate::request_context::RequestContext;
use crate::schema::{CoreField, CoreMutation, Package};
use crate::system_resolver::SystemResolver;

use super::{Arguments, OperationEnv, Resolved, SCHEMA_FILE_PATH, coerce_arguments};

pub(crate) async fn resolve_core_field(
    resolver: &SystemResolver,
    kind: CoreField,
    field: &Positioned<Field>,
    env: &OperationEnv<'_>,
    ctx: &RequestContext,
) -> Result<Resolved, ResolverError> {
    if !ctx.should_force() {
        return Ok(Resolved::Lazy);
    }
    let arguments = coerce_arguments(&field.node, &env.variables)?;
    match kind {
        CoreField::Image => image(resolver, &arguments, ctx).await,
        CoreField::Exec => exec(resolver, &arguments, ctx).await,
        CoreField::Dockerfile => dockerfile(resolver, &arguments, ctx).await,
    }
}

pub(crate) async fn resolve_core_mutation(
    resolver: &SystemResolver,
    kind: CoreMutation,
    field: &Positioned<Field>,
    env: &OperationEnv<'_>,
    ctx: &RequestContext,
) -> Result<Resolved, ResolverError> {
    let arguments = coerce_arguments(&field.node, &env.variables)?;
    match kind {
        CoreMutation::Import => import(resolver, &arguments, ctx).await,
        CoreMutation::Readfile => readfile(resolver, &arguments, ctx).await,
        CoreMutation::Readsecret => {
            let id = arguments.string("id")?;
            Ok(Resolved::Value(serde_json::Value::String(
                ctx.secret(&id)?,
            )))
        }
        CoreMutation::Clientdir => {
            let id = arguments.string("id")?;
            let definition = State::local(id).marshal(None)?;
            Ok(Resolved::Fs(Fs::from_definition(definition)))
        }
        CoreMutation::Evaluate => evaluate(resolver, &arguments, ctx).await,
    }
}

async fn image(
    resolver: &SystemResolver,
    arguments: &Arguments,
    ctx: &RequestContext,
) -> Result<Resolved, ResolverError> {
    let reference = arguments.string("ref")?;
    let platform = ctx.platform();

    let key = format!("{reference}@{platform}");
    let (fs, _hit) = resolver
        .image_cache
        .get_or_initialize(ctx, key, |_ctx| {
            let reference = reference.clone();
            let platform = platform.clone();
            async move {
                let definition = State::image(reference).marshal(Some(&platform))?;
                Ok(Fs::from_definition(definition))
            }
        })
        .await?;

    Ok(Resolved::Value(json!({ "fs": fs.serialize()? })))
}

async fn exec(
    resolver: &SystemResolver,
    arguments: &Arguments,
    ctx: &RequestContext,
) -> Result<Resolved, ResolverError> {
    let fs = arguments.fs("fs")?;
    let args = arguments.string_list("args")?;
    if args.is_empty() {
        return Err(ResolverError::InvalidArgument(
            "exec requires at least one argument".to_string(),
        ));
    }

    let fs = resolver.force_fs(&fs, ctx).await?;
    let platform = ctx.platform();
    let definition = fs.to_state()?.run(args).root().marshal(Some(&platform))?;

    Ok(Resolved::Value(
        json!({ "fs": Fs::from_definition(definition).serialize()? }),
    ))
}

async fn dockerfile(
    resolver: &SystemResolver,
    arguments: &Arguments,
    ctx: &RequestContext,
) -> Result<Resolved, ResolverError> {
    let context = arguments.fs("context")?;
    let dockerfile_name = arguments.opt_string("dockerfileName")?;

    let context = resolver.force_fs(&context, ctx).await?;
    let pb = context.pb.clone().ok_or(FsError::NotMaterialized)?;
    let platform = ctx.platform();

    let key = format!(
        "{}:{}@{platform}",
        pb.canonical()?,
        dockerfile_name.as_deref().unwrap_or_default()
    );
    let (fs, _hit) = resolver
        .dockerfile_cache
        .get_or_initialize(ctx, key, |cctx| {
            let pb = pb.clone();
            let dockerfile_name = dockerfile_name.clone();
            let platform = platform.clone();
            async move {
                let gateway = cctx.gateway()?;

                let mut frontend_opts = BTreeMap::new();
                frontend_opts.insert(FRONTEND_OPT_PLATFORM.to_string(), platform.to_string());
                if let Some(name) = dockerfile_name {
                    frontend_opts.insert(FRONTEND_OPT_FILENAME.to_string(), name);
                }

                // the context doubles as the dockerfile input, as the
                // frontend convention expects
                let mut frontend_inputs = BTreeMap::new();
                frontend_inputs.insert(FRONTEND_INPUT_CONTEXT.to_string(), pb.clone());
                frontend_inputs.insert(FRONTEND_INPUT_DOCKERFILE.to_string(), pb);

                let request = SolveRequest {
                    frontend: Some(DOCKERFILE_FRONTEND.to_string()),
                    frontend_opts,
                    frontend_inputs,
                    ..Default::default()
                };
                let result = gateway.solve(request).await.map_err(build_error)?;
                let reference = result.single_ref().map_err(build_error)?;
                Ok(Fs::from_definition(reference.definition()))
            }
        })
        .await?;

    Ok(Resolved::Fs(fs))
}

fn build_error(error: GatewayError) -> ResolverError {
    match error {
        GatewayError::Canceled => ResolverError::Canceled,
        other => ResolverError::BuildFailed(other.to_string()),
    }
}

async fn import(
    resolver: &SystemResolver,
    arguments: &Arguments,
    ctx: &RequestContext,
) -> Result<Resolved, ResolverError> {
    let name = arguments.string("name")?;
    if resolver.has_package(&name) {
        return Err(ResolverError::NameInUse(name));
    }

    let fs = arguments.fs("fs")?;
    let fs = resolver.force_fs(&fs, ctx).await?;
    let pb = fs.pb.clone().ok_or(FsError::NotMaterialized)?;

    let gateway = ctx.gateway()?;
    let result = gateway.solve(SolveRequest::evaluate(pb)).await?;
    let schema_bytes = result.single_ref()?.read_file(SCHEMA_FILE_PATH).await?;
    let schema_text = String::from_utf8_lossy(&schema_bytes);

    let package_schema = crate::schema::stitch(&name, &schema_text)?;
    resolver.install_package(Package {
        name: name.clone(),
        fs: fs.clone(),
        schema: package_schema,
    })?;
    debug!(package = %name, "imported package");

    Ok(Resolved::Value(json!({
        "name": name,
        "fs": fs.serialize()?,
    })))
}

async fn readfile(
    resolver: &SystemResolver,
    arguments: &Arguments,
    ctx: &RequestContext,
) -> Result<Resolved, ResolverError> {
    let fs = arguments.fs("fs")?;
    let path = arguments.string("path")?;

    let fs = resolver.force_fs(&fs, ctx).await?;
    let pb = fs.pb.clone().ok_or(FsError::NotMaterialized)?;

    let gateway = ctx.gateway()?;
    let result = gateway.solve(SolveRequest::evaluate(pb)).await?;
    let bytes = result.single_ref()?.read_file(&path).await?;

    // binary contents degrade to replacement characters, never to corruption
    Ok(Resolved::Value(serde_json::Value::String(
        String::from_utf8_lossy(&bytes).into_owned(),
    )))
}

async fn evaluate(
    resolver: &SystemResolver,
    arguments: &Arguments,
    ctx: &RequestContext,
) -> Result<Resolved, ResolverError> {
    let fs = arguments.fs("fs")?;
    let fs = resolver.force_fs(&fs, ctx).await?;
    let pb = fs.pb.clone().ok_or(FsError::NotMaterialized)?;

    let gateway = ctx.gateway()?;
    gateway.solve(SolveRequest::evaluate(pb)).await?;

    Ok(Resolved::Fs(fs))
}
