// Copyright Exograph, Inc. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file at the root of this repository.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use thiserror::Error;

use kiln_buildgraph::{DefinitionError, GatewayError};

use crate::cache_map::CacheError;
use crate::fs::FsError;
use crate::request_context::ContextError;
use crate::schema::SchemaError;

/// The top-level resolution error.
///
/// `Clone` is load-bearing: the memoization map replays a single producer
/// outcome to every concurrent waiter, so all payloads are strings or shared
/// handles.
#[derive(Debug, Error, Clone)]
pub enum ResolverError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("package name `{0}` is already in use")]
    NameInUse(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("dockerfile build failed: {0}")]
    BuildFailed(String),

    #[error("action {package}.{action} failed at {stage}: {message}")]
    ActionFailed {
        package: String,
        action: String,
        stage: String,
        message: String,
    },

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("canceled")]
    Canceled,
}

impl From<GatewayError> for ResolverError {
    fn from(error: GatewayError) -> Self {
        match error {
            GatewayError::Canceled => ResolverError::Canceled,
            other => ResolverError::Backend(other.to_string()),
        }
    }
}

impl From<DefinitionError> for ResolverError {
    fn from(error: DefinitionError) -> Self {
        ResolverError::Backend(error.to_string())
    }
}
