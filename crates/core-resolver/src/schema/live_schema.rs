// Copyright Exograph, Inc. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file at the root of this repository.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The merged, immutable schema value.
//!
//! Assembled from the package table every time a package is added and
//! swapped in behind an `Arc`, so queries in flight keep the schema they
//! started with. `Query` is merged field-wise (collisions are errors); other
//! types are last-writer-wins, a known limitation of the merge.

use std::collections::{BTreeMap, HashMap, HashSet};

use apollo_parser::Parser;
use apollo_parser::ast::{self, AstNode};
use async_graphql_parser::types::{BaseType, Type, TypeKind, TypeSystemDefinition};

use super::{FieldBinding, Package, SchemaError};

pub struct LiveSchema {
    pub sdl: String,
    /// type name -> field name -> named return type
    types: HashMap<String, HashMap<String, String>>,
    bindings: HashMap<(String, String), FieldBinding>,
}

impl LiveSchema {
    /// Union all package fragments into one schema. Deterministic: `core`
    /// first, then the remaining packages in name order.
    pub fn assemble(packages: &BTreeMap<String, Package>) -> Result<Self, SchemaError> {
        let mut query_fields: Vec<String> = Vec::new();
        let mut seen_query_fields: HashSet<String> = HashSet::new();
        let mut others: Vec<String> = Vec::new();

        let core = packages.get("core");
        let rest = packages.values().filter(|p| p.name != "core");
        for package in core.into_iter().chain(rest) {
            split_fragment(
                &package.schema.type_defs,
                &mut query_fields,
                &mut seen_query_fields,
                &mut others,
            )?;
        }

        let sdl = format!(
            "{others}\ntype Query {{\n  {query_fields}\n}}\n",
            others = others.join("\n"),
            query_fields = query_fields.join("\n  "),
        );

        let types = index_types(&sdl)?;

        let mut bindings = HashMap::new();
        for package in packages.values() {
            for binding in &package.schema.bindings {
                bindings.insert(
                    (binding.type_name.clone(), binding.field.clone()),
                    binding.resolver.clone(),
                );
            }
        }

        Ok(Self { sdl, types, bindings })
    }

    pub fn binding(&self, type_name: &str, field: &str) -> Option<&FieldBinding> {
        self.bindings
            .get(&(type_name.to_string(), field.to_string()))
    }

    pub fn has_field(&self, type_name: &str, field: &str) -> bool {
        self.types
            .get(type_name)
            .is_some_and(|fields| fields.contains_key(field))
    }

    /// The named base type a field resolves to, lists and non-nulls stripped.
    pub fn field_type(&self, type_name: &str, field: &str) -> Option<&str> {
        self.types
            .get(type_name)
            .and_then(|fields| fields.get(field))
            .map(String::as_str)
    }
}

/// Pull the `Query` fields out of one package fragment, keeping everything
/// else verbatim.
fn split_fragment(
    type_defs: &str,
    query_fields: &mut Vec<String>,
    seen_query_fields: &mut HashSet<String>,
    others: &mut Vec<String>,
) -> Result<(), SchemaError> {
    let tree = Parser::new(type_defs).parse();
    if tree.errors().len() != 0 {
        let messages = tree
            .errors()
            .map(|error| error.message().to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(SchemaError::Parse(messages));
    }

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
                    if !seen_query_fields.insert(field_name.clone()) {
                        return Err(SchemaError::Conflict(field_name));
                    }
                    query_fields.push(field.syntax().to_string().trim().to_string());
                }
                continue;
            }
        }
        others.push(definition.syntax().to_string().trim().to_string());
    }

    Ok(())
}

fn index_types(sdl: &str) -> Result<HashMap<String, HashMap<String, String>>, SchemaError> {
    let document =
        async_graphql_parser::parse_schema(sdl).map_err(|e| SchemaError::Parse(e.to_string()))?;

    let mut types: HashMap<String, HashMap<String, String>> = HashMap::new();
    for definition in document.definitions {
        let TypeSystemDefinition::Type(type_definition) = definition else {
            continue;
        };
        let type_definition = type_definition.node;
        let TypeKind::Object(object) = type_definition.kind else {
            continue;
        };

        // last writer wins, same as the SDL merge
        let fields = types
            .entry(type_definition.name.node.to_string())
            .or_default();
        fields.clear();
        for field in object.fields {
            fields.insert(
                field.node.name.node.to_string(),
                base_type_name(&field.node.ty.node).to_string(),
            );
        }
    }
    Ok(types)
}

fn base_type_name(ty: &Type) -> &str {
    match &ty.base {
        BaseType::Named(name) => name.as_str(),
        BaseType::List(inner) => base_type_name(inner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{core_package, stitch};

    fn with_greet() -> BTreeMap<String, Package> {
        let mut packages = BTreeMap::new();
        packages.insert("core".to_string(), core_package());

        let greet = stitch("greet", "type Query { hello(name: String!): String! }").unwrap();
        packages.insert(
            "greet".to_string(),
            Package {
                name: "greet".to_string(),
                fs: crate::fs::Fs::default(),
                schema: greet,
            },
        );
        packages
    }

    #[test]
    fn core_alone_assembles() {
        let mut packages = BTreeMap::new();
        packages.insert("core".to_string(), core_package());
        let schema = LiveSchema::assemble(&packages).unwrap();

        assert!(matches!(
            schema.binding("Query", "core"),
            Some(FieldBinding::Passthrough)
        ));
        assert!(schema.sdl.contains("scalar FS"));
        assert!(schema.sdl.contains("type Query {\n  core: Core!\n}"));
        assert_eq!(schema.field_type("Query", "core"), Some("Core"));
        assert_eq!(schema.field_type("Core", "image"), Some("CoreImage"));
        assert_eq!(schema.field_type("CoreImage", "fs"), Some("FS"));
        assert_eq!(schema.field_type("Mutation", "readfile"), Some("String"));
    }

    #[test]
    fn imported_packages_extend_query() {
        let schema = LiveSchema::assemble(&with_greet()).unwrap();

        assert_eq!(schema.field_type("Query", "greet"), Some("Greet"));
        assert_eq!(schema.field_type("Greet", "hello"), Some("String"));
        assert!(matches!(
            schema.binding("Greet", "hello"),
            Some(FieldBinding::Action { .. })
        ));
        // core is still there
        assert!(schema.has_field("Query", "core"));
    }

    #[test]
    fn query_field_collisions_are_rejected() {
        let mut packages = with_greet();
        // a second package whose namespace field collides with `greet`
        let clash = stitch("greet", "type Query { other: String }").unwrap();
        packages.insert(
            "greet2".to_string(),
            Package {
                name: "greet2".to_string(),
                fs: crate::fs::Fs::default(),
                schema: clash,
            },
        );

        assert!(matches!(
            LiveSchema::assemble(&packages),
            Err(SchemaError::Conflict(field)) if field == "greet"
        ));
    }
}
