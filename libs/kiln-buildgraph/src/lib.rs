// Copyright Exograph, Inc. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file at the root of this repository.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Container build-graph definitions and the gateway contract.
//!
//! A [`State`] is an immutable handle on a DAG of filesystem-producing
//! operations (image pulls, execs, file writes). Marshalling a state yields a
//! [`Definition`]: a flat, serializable op table that a [`Gateway`]
//! implementation can solve into a readable reference.

pub mod def;
pub mod gateway;
pub mod platform;
pub mod state;

pub use def::{Definition, DefinitionError, ExecOp, MountOp, Op, OutputRef, SshSocketOp};
pub use gateway::{Gateway, GatewayError, Reference, SolveRequest, SolveResult};
pub use platform::Platform;
pub use state::{Exec, State};
