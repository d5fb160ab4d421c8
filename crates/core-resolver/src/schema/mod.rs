// Copyright Exograph, Inc. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file at the root of this repository.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Packages and the live schema.
//!
//! Every capability of the engine, the built-ins included, is a package: a
//! namespace, a filesystem (empty for `core`), and a schema fragment with
//! resolver bindings. The live schema is re-derived from the package table on
//! every import.

pub mod live_schema;
pub mod stitcher;

pub use live_schema::LiveSchema;
pub use stitcher::stitch;

use thiserror::Error;

use crate::fs::Fs;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaError {
    #[error("invalid package name `{0}`")]
    InvalidName(String),

    #[error("failed to parse package schema: {0}")]
    Parse(String),

    #[error("query field `{0}` is defined by more than one package")]
    Conflict(String),
}

/// How a field of the live schema is resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldBinding {
    /// Namespace parent (`Query.core`, `Query.<pkg>`): resolves to an empty
    /// object whose children carry the real resolvers.
    Passthrough,
    Core(CoreField),
    CoreMutation(CoreMutation),
    /// A field of an imported package, dispatched to its entrypoint.
    Action { package: String, action: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreField {
    Image,
    Exec,
    Dockerfile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreMutation {
    Import,
    Readfile,
    Readsecret,
    Clientdir,
    Evaluate,
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub type_name: String,
    pub field: String,
    pub resolver: FieldBinding,
}

impl Binding {
    fn new(type_name: &str, field: &str, resolver: FieldBinding) -> Self {
        Self {
            type_name: type_name.to_string(),
            field: field.to_string(),
            resolver,
        }
    }
}

/// A package's contribution to the live schema.
#[derive(Debug, Clone)]
pub struct PackageSchema {
    pub type_defs: String,
    pub bindings: Vec<Binding>,
}

#[derive(Debug, Clone)]
pub struct Package {
    pub name: String,
    pub fs: Fs,
    pub schema: PackageSchema,
}

pub(crate) const CORE_SCHEMA: &str = r#"
scalar FS

type CoreImage {
  fs: FS!
}

type CoreExec {
  fs: FS!
}

type Core {
  image(ref: String!): CoreImage
  exec(fs: FS!, args: [String]!): CoreExec
  dockerfile(context: FS!, dockerfileName: String): FS!
}

type Query {
  core: Core!
}

type Package {
  name: String!
  fs: FS!
}

type Mutation {
  import(name: String!, fs: FS!): Package
  readfile(fs: FS!, path: String!): String
  readsecret(id: String!): String
  clientdir(id: String!): FS
  evaluate(fs: FS!): FS
}
"#;

/// The built-in package. Its filesystem is empty; its resolvers live in this
/// process rather than behind an entrypoint.
pub(crate) fn core_package() -> Package {
    let bindings = vec![
        Binding::new("Query", "core", FieldBinding::Passthrough),
        Binding::new("Core", "image", FieldBinding::Core(CoreField::Image)),
        Binding::new("Core", "exec", FieldBinding::Core(CoreField::Exec)),
        Binding::new("Core", "dockerfile", FieldBinding::Core(CoreField::Dockerfile)),
        Binding::new("Mutation", "import", FieldBinding::CoreMutation(CoreMutation::Import)),
        Binding::new("Mutation", "readfile", FieldBinding::CoreMutation(CoreMutation::Readfile)),
        Binding::new("Mutation", "readsecret", FieldBinding::CoreMutation(CoreMutation::Readsecret)),
        Binding::new("Mutation", "clientdir", FieldBinding::CoreMutation(CoreMutation::Clientdir)),
        Binding::new("Mutation", "evaluate", FieldBinding::CoreMutation(CoreMutation::Evaluate)),
    ];

    Package {
        name: "core".to_string(),
        fs: Fs::default(),
        schema: PackageSchema {
            type_defs: CORE_SCHEMA.to_string(),
            bindings,
        },
    }
}
