// Copyright Exograph, Inc. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file at the root of this repository.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The lazy resolution and dispatch engine.
//!
//! Sits between a GraphQL transport and a build backend: queries describe
//! containerized computations, results flow between fields as filesystem
//! handles, and nothing is built until an ancestor field forces it.

pub mod cache_map;
pub mod error;
pub mod fs;
pub mod request_context;
pub mod resolver;
pub mod schema;
pub mod system_resolver;

mod operation_printer;

pub use error::ResolverError;
pub use fs::{Fs, FsError, WireRequest};
pub use request_context::{ContextError, RequestContext};
pub use system_resolver::SystemResolver;
