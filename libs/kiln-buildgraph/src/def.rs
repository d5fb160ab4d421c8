// Copyright Exograph, Inc. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file at the root of this repository.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The serialized form of a build graph.
//!
//! A [`Definition`] is a topologically ordered op table: every [`OutputRef`]
//! inside an op points at an earlier op. Serialization is deterministic, so
//! the canonical encoding of a definition doubles as its identity (and as a
//! memoization key for the layers above).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::platform::Platform;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("cannot marshal an empty state")]
    EmptyState,

    #[error("malformed definition: {0}")]
    Malformed(String),

    #[error("failed to encode definition: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Selects the output of an op: its root filesystem, or (for execs) the
/// filesystem left behind at one of its mount points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    pub op: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount: Option<String>,
}

impl OutputRef {
    pub fn root(op: usize) -> Self {
        Self { op, mount: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Op {
    /// Pull an image by reference.
    Image {
        reference: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        platform: Option<Platform>,
    },
    /// A directory streamed from the client, identified out-of-band.
    Local { name: String },
    /// Write a single file on top of `input` (scratch when absent).
    Mkfile {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<OutputRef>,
        path: String,
        mode: u32,
        /// base64 of the file contents
        data: String,
    },
    /// Run a command in a container rooted at `input`.
    Exec(ExecOp),
    /// A solved reference, pinned by digest. Produced by gateways when they
    /// hand results back for further composition.
    Pinned { digest: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOp {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<OutputRef>,
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountOp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_sockets: Vec<SshSocketOp>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub readonly_rootfs: bool,
    /// Display name for progress reporting; not part of the op's identity as
    /// far as callers are concerned, but kept in the encoding for the solver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOp {
    pub dest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<OutputRef>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub readonly: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tmpfs: bool,
    /// Whether the mount's final contents are addressable as an output.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub output: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshSocketOp {
    pub id: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub ops: Vec<Op>,
    pub result: OutputRef,
}

impl Definition {
    /// Deterministic encoding of the definition. Equal definitions produce
    /// equal strings, so this serves as a cache key.
    pub fn canonical(&self) -> Result<String, DefinitionError> {
        Ok(serde_json::to_string(self)?)
    }
}
