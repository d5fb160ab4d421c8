// Copyright Exograph, Inc. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file at the root of this repository.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The contract between the engine and the build backend.
//!
//! The engine never talks to a container runtime directly: it marshals
//! [`Definition`]s and hands them to an injected [`Gateway`]. Results come
//! back as [`Reference`]s whose contents can be read file-by-file.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::def::Definition;

/// Frontend id for Dockerfile builds.
pub const DOCKERFILE_FRONTEND: &str = "dockerfile.v0";
/// Conventional frontend input carrying the build context.
pub const FRONTEND_INPUT_CONTEXT: &str = "context";
/// Conventional frontend input carrying the directory with the Dockerfile.
pub const FRONTEND_INPUT_DOCKERFILE: &str = "dockerfile";
/// Frontend option selecting a non-default Dockerfile name.
pub const FRONTEND_OPT_FILENAME: &str = "filename";
/// Frontend option selecting the build platform.
pub const FRONTEND_OPT_PLATFORM: &str = "platform";

#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    #[error("solve canceled")]
    Canceled,

    #[error("{0}")]
    Solve(String),

    #[error("failed to read {path}: {reason}")]
    ReadFile { path: String, reason: String },

    #[error("solve produced no reference")]
    EmptyResult,

    #[error("expected exactly one reference, got {0}")]
    MultipleRefs(usize),
}

#[derive(Debug, Default)]
pub struct SolveRequest {
    pub definition: Option<Definition>,
    /// Force the graph to be fully built rather than just registered.
    pub evaluate: bool,
    pub frontend: Option<String>,
    pub frontend_opts: BTreeMap<String, String>,
    pub frontend_inputs: BTreeMap<String, Definition>,
}

impl SolveRequest {
    pub fn evaluate(definition: Definition) -> Self {
        Self {
            definition: Some(definition),
            evaluate: true,
            ..Default::default()
        }
    }
}

pub struct SolveResult {
    refs: Vec<Arc<dyn Reference>>,
}

impl SolveResult {
    pub fn new(refs: Vec<Arc<dyn Reference>>) -> Self {
        Self { refs }
    }

    pub fn single_ref(&self) -> Result<&Arc<dyn Reference>, GatewayError> {
        match self.refs.as_slice() {
            [single] => Ok(single),
            [] => Err(GatewayError::EmptyResult),
            many => Err(GatewayError::MultipleRefs(many.len())),
        }
    }
}

/// A solved filesystem whose contents can be read.
#[async_trait]
pub trait Reference: Send + Sync {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, GatewayError>;

    /// A definition pinned to this solved result, suitable for further
    /// composition.
    fn definition(&self) -> Definition;
}

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn solve(&self, request: SolveRequest) -> Result<SolveResult, GatewayError>;
}
