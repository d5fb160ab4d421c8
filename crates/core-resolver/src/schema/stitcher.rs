// Copyright Exograph, Inc. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file at the root of this repository.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Wrapping a package's schema under its namespace.
//!
//! A package declares its actions as fields of `Query`:
//!
//! ```graphql
//! type AlpineBuild { fs: FS! }
//! type Query { build(pkgs: [String]!): AlpineBuild }
//! ```
//!
//! Imported as `alpine`, that becomes:
//!
//! ```graphql
//! type AlpineBuild { fs: FS! }
//! type Alpine { build(pkgs: [String]!): AlpineBuild }
//! type Query { alpine: Alpine! }
//! ```
//!
//! apollo-parser is used here (rather than the executor's parser) because the
//! rewrite keeps every non-`Query` definition byte-for-byte, which its
//! lossless syntax tree gives for free.

use apollo_parser::ast::{self, AstNode};
use apollo_parser::Parser;

use super::{Binding, FieldBinding, PackageSchema, SchemaError};

pub fn stitch(package_name: &str, type_defs: &str) -> Result<PackageSchema, SchemaError> {
    if !is_valid_name(package_name) {
        return Err(SchemaError::InvalidName(package_name.to_string()));
    }
    let namespace_type = capitalize(package_name);

    let tree = Parser::new(type_defs).parse();
    if tree.errors().len() != 0 {
        let messages = tree
            .errors()
            .map(|error| error.message().to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(SchemaError::Parse(messages));
    }

    let mut actions = Vec::new();
    let mut bindings = vec![Binding::new(
        "Query",
        package_name,
        FieldBinding::Passthrough,
    )];
    let mut others = Vec::new();

    for definition in tree.document().definitions() {
        if let ast::Definition::ObjectTypeDefinition(object) = &definition {
            if object.name().is_some_and(|name| name.text() == "Query") {
                let Some(fields) = object.fields_definition() else {
                    continue;
                };
                for field in fields.field_definitions() {
                    let field_name = field
                        .name()
                        .ok_or_else(|| {
                            SchemaError::Parse("query field without a name".to_string())
                        })?
                        .text()
                        .to_string();
                    actions.push(field.syntax().to_string().trim().to_string());
                    bindings.push(Binding::new(
                        &namespace_type,
                        &field_name,
                        FieldBinding::Action {
                            package: package_name.to_string(),
                            action: field_name.clone(),
                        },
                    ));
                }
                continue;
            }
        }
        others.push(definition.syntax().to_string().trim().to_string());
    }

    let type_defs = format!(
        "{others}\ntype {namespace_type} {{\n  {actions}\n}}\ntype Query {{\n  {package_name}: {namespace_type}!\n}}\n",
        others = others.join("\n"),
        actions = actions.join("\n  "),
    );

    Ok(PackageSchema { type_defs, bindings })
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}
