// Copyright Exograph, Inc. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file at the root of this repository.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Dispatching a field of an imported package to its entrypoint.
//!
//! The package re-implements the same GraphQL surface inside its container
//! and calls back through the socket bridge for nested operations, so
//! actions compose with core operations and with each other.

use std::collections::BTreeMap;

use async_graphql_parser::Positioned;
use async_graphql_parser::types::Field;
use tracing::instrument;

use kiln_buildgraph::{SolveRequest, State};

use crate::cache_map::CacheError;
use crate::error::ResolverError;
use crate::fs::{Fs, WireRequest};
use crate::operation_printer::{flatten_selection_set, print_query};
use crate::request_context::RequestContext;
use crate::system_resolver::SystemResolver;

use super::{
    FS_MOUNT_ROOT, INPUTS_MOUNT, OUTPUTS_MOUNT, OperationEnv, REQUEST_FILE_PATH, Resolved,
    SOCKET_BRIDGE_ID, SOCKET_PATH, TrailSeg, coerce_arguments,
};

#[instrument(skip_all, fields(package = %package, action = %action))]
pub(crate) async fn resolve_action(
    resolver: &SystemResolver,
    package: &str,
    action: &str,
    field: &Positioned<Field>,
    env: &OperationEnv<'_>,
    trail: &[TrailSeg],
    ctx: &RequestContext,
) -> Result<Resolved, ResolverError> {
    // Action dispatch is itself a forcing trigger: reaching an action field
    // forces the subtree it needs.
    let ctx = ctx.forced();
    let ctx = &ctx;

    let fail = |stage: &str, message: String| ResolverError::ActionFailed {
        package: package.to_string(),
        action: action.to_string(),
        stage: stage.to_string(),
        message,
    };

    // The action does not know its queries are stitched under the package
    // name; strip the wrapper so it receives what the client wrote.
    let query = elide_namespace(env).map_err(|error| fail("rewrite", error.to_string()))?;
    let wire = WireRequest {
        query,
        variables: env.variables.clone(),
        operation_name: env.name.map(str::to_string),
    };
    let input_bytes =
        serde_json::to_vec(&wire).map_err(|error| fail("encode", error.to_string()))?;

    let package_fs = resolver
        .package_fs(package)
        .ok_or_else(|| fail("lookup", "package is not imported".to_string()))?;

    let arguments = coerce_arguments(&field.node, &env.variables)?;
    let mut fs_arguments = BTreeMap::new();
    collect_fs_paths(
        &serde_json::Value::Object(arguments.raw().clone()),
        FS_MOUNT_ROOT,
        &mut fs_arguments,
    );

    let platform = ctx.platform();
    let inputs = State::scratch().file(REQUEST_FILE_PATH, 0o644, input_bytes);
    let root = package_fs
        .to_state()
        .map_err(|error| fail("prepare", error.to_string()))?;

    let mut exec = root
        .run(vec!["/entrypoint".to_string()])
        .ssh_socket(SOCKET_BRIDGE_ID, SOCKET_PATH)
        .readonly_mount(INPUTS_MOUNT, inputs)
        .tmpfs("/tmp")
        .readonly_rootfs()
        .custom_name(format!("{package}.{action}"));

    for (mount_path, fs) in fs_arguments {
        let fs = match resolver.force_fs(&fs, ctx).await {
            Ok(fs) => fs,
            Err(ResolverError::Canceled) => return Err(ResolverError::Canceled),
            Err(error) => return Err(fail("mounts", error.to_string())),
        };
        let state = fs
            .to_state()
            .map_err(|error| fail("mounts", error.to_string()))?;
        exec = exec.readonly_mount(mount_path, state);
    }

    let output = exec.output_mount(OUTPUTS_MOUNT, State::scratch());
    let definition = output
        .marshal(Some(&platform))
        .map_err(|error| fail("marshal", error.to_string()))?;
    let key = definition
        .canonical()
        .map_err(|error| fail("marshal", error.to_string()))?;

    let (decoded, _hit) = resolver
        .action_cache
        .get_or_initialize(ctx, key, |cctx| {
            let definition = definition.clone();
            async move {
                let gateway = cctx.gateway()?;
                let result = gateway.solve(SolveRequest::evaluate(definition)).await?;
                let bytes = result.single_ref()?.read_file(REQUEST_FILE_PATH).await?;
                serde_json::from_slice::<serde_json::Value>(&bytes)
                    .map_err(|error| ResolverError::InvalidQuery(error.to_string()))
            }
        })
        .await
        .map_err(|error| match error {
            ResolverError::Canceled => ResolverError::Canceled,
            recursive @ ResolverError::Cache(CacheError::RecursiveCall) => recursive,
            other => fail("solve", other.to_string()),
        })?;

    // Walk the response to the selected field, skipping the namespace
    // segment the package never saw.
    let mut value = &decoded;
    let segments =
        std::iter::once("data").chain(trail.iter().skip(1).map(|seg| seg.output_key.as_str()));
    for segment in segments {
        value = value
            .as_object()
            .and_then(|map| map.get(segment))
            .ok_or_else(|| fail("navigate", format!("output is missing `{segment}`")))?;
    }

    Ok(Resolved::Value(value.clone()))
}

fn elide_namespace(env: &OperationEnv<'_>) -> Result<String, ResolverError> {
    let roots = flatten_selection_set(&env.operation.node.selection_set.node, env.fragments)?;
    let namespace_field = roots
        .first()
        .ok_or_else(|| ResolverError::InvalidQuery("empty selection set".to_string()))?;
    print_query(
        &env.header,
        &namespace_field.node.selection_set.node,
        env.fragments,
    )
}

/// Recursively collect every filesystem-handle argument with a synthetic
/// mount path: object keys become path segments, list indices numeric
/// segments.
fn collect_fs_paths(
    value: &serde_json::Value,
    current_path: &str,
    mounts: &mut BTreeMap<String, Fs>,
) {
    match value {
        serde_json::Value::String(candidate) => {
            // FS arguments arrive as serialized handles; anything that
            // decodes as a non-empty handle gets mounted
            if let Ok(fs) = Fs::parse_str(candidate) {
                if !fs.is_empty() {
                    mounts.insert(current_path.to_string(), fs);
                }
            }
        }
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                collect_fs_paths(child, &format!("{current_path}/{key}"), mounts);
            }
        }
        serde_json::Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                collect_fs_paths(child, &format!("{current_path}/{index}"), mounts);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn handle() -> (String, Fs) {
        let fs = Fs::from_request(WireRequest {
            query: "{ core { image(ref: \"alpine\") { fs } } }".to_string(),
            ..Default::default()
        });
        (fs.serialize().unwrap(), fs)
    }

    #[test]
    fn fs_arguments_map_to_mount_paths() {
        let (encoded, fs) = handle();
        let arguments = json!({
            "src": encoded,
            "nested": { "inner": encoded },
            "list": [encoded, "plain string"],
            "count": 3,
        });

        let mut mounts = BTreeMap::new();
        collect_fs_paths(&arguments, "/mnt", &mut mounts);

        assert_eq!(
            mounts.keys().collect::<Vec<_>>(),
            vec!["/mnt/list/0", "/mnt/nested/inner", "/mnt/src"]
        );
        assert!(mounts.values().all(|mounted| *mounted == fs));
    }

    #[test]
    fn plain_strings_are_not_mounted() {
        let arguments = json!({ "name": "world", "flag": true });
        let mut mounts = BTreeMap::new();
        collect_fs_paths(&arguments, "/mnt", &mut mounts);
        assert!(mounts.is_empty());
    }
}
