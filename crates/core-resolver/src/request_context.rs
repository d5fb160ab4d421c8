// Copyright Exograph, Inc. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file at the root of this repository.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Per-request state.
//!
//! A [`RequestContext`] is immutable once created; derived contexts layer a
//! new value (platform, force flag, recursion marker) over a cheap clone of
//! the parent. Recursion markers therefore never leak across requests: they
//! exist only in the context values that flow down one resolution tree.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use kiln_buildgraph::{Gateway, Platform};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ContextError {
    /// Missing backend client. This is a wiring bug in the embedder, not a
    /// user error.
    #[error("no gateway client in request context")]
    Unavailable,

    #[error("no secret with id `{0}`")]
    SecretNotFound(String),
}

/// Identifies one in-flight memoization entry: (map identity, key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    map_id: u64,
    key: String,
}

impl Marker {
    pub(crate) fn new(map_id: u64, key: String) -> Self {
        Self { map_id, key }
    }
}

#[derive(Clone, Default)]
struct Markers(Option<Arc<MarkerNode>>);

struct MarkerNode {
    marker: Marker,
    parent: Markers,
}

impl Markers {
    fn with(&self, marker: Marker) -> Self {
        Self(Some(Arc::new(MarkerNode {
            marker,
            parent: self.clone(),
        })))
    }

    fn contains(&self, marker: &Marker) -> bool {
        let mut current = &self.0;
        while let Some(node) = current {
            if node.marker == *marker {
                return true;
            }
            current = &node.parent.0;
        }
        false
    }
}

#[derive(Clone, Default)]
pub struct RequestContext {
    gateway: Option<Arc<dyn Gateway>>,
    platform: Option<Platform>,
    secrets: Arc<HashMap<String, String>>,
    force: bool,
    markers: Markers,
}

impl RequestContext {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self {
            gateway: Some(gateway),
            ..Default::default()
        }
    }

    pub fn with_platform(&self, platform: Platform) -> Self {
        Self {
            platform: Some(platform),
            ..self.clone()
        }
    }

    pub fn with_secrets(&self, secrets: HashMap<String, String>) -> Self {
        Self {
            secrets: Arc::new(secrets),
            ..self.clone()
        }
    }

    /// Derive a context under which suspendable resolvers do their
    /// substantive work instead of returning recipes.
    pub fn forced(&self) -> Self {
        Self {
            force: true,
            ..self.clone()
        }
    }

    pub fn should_force(&self) -> bool {
        self.force
    }

    pub(crate) fn with_marker(&self, marker: Marker) -> Self {
        Self {
            markers: self.markers.with(marker),
            ..self.clone()
        }
    }

    pub(crate) fn has_marker(&self, marker: &Marker) -> bool {
        self.markers.contains(marker)
    }

    pub fn gateway(&self) -> Result<Arc<dyn Gateway>, ContextError> {
        self.gateway.clone().ok_or(ContextError::Unavailable)
    }

    pub fn platform(&self) -> Platform {
        self.platform.clone().unwrap_or_else(Platform::host)
    }

    pub fn secret(&self, id: &str) -> Result<String, ContextError> {
        self.secrets
            .get(id)
            .cloned()
            .ok_or_else(|| ContextError::SecretNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_gateway_is_unavailable() {
        let ctx = RequestContext::default();
        assert_eq!(ctx.gateway().err(), Some(ContextError::Unavailable));
    }

    #[test]
    fn platform_defaults_to_host() {
        let ctx = RequestContext::default();
        assert_eq!(ctx.platform(), Platform::host());

        let pinned = ctx.with_platform(Platform::new("linux", "arm64"));
        assert_eq!(pinned.platform(), Platform::new("linux", "arm64"));
        // the parent is untouched
        assert_eq!(ctx.platform(), Platform::host());
    }

    #[test]
    fn secrets_resolve_or_fail_typed() {
        let ctx = RequestContext::default()
            .with_secrets(HashMap::from([("foo".to_string(), "bar".to_string())]));
        assert_eq!(ctx.secret("foo").unwrap(), "bar");
        assert_eq!(
            ctx.secret("zzz").unwrap_err(),
            ContextError::SecretNotFound("zzz".to_string())
        );
    }

    #[test]
    fn markers_layer_without_leaking_up() {
        let ctx = RequestContext::default();
        let marker = Marker::new(1, "key".to_string());
        let child = ctx.with_marker(marker.clone());

        assert!(child.has_marker(&marker));
        assert!(!ctx.has_marker(&marker));
        assert!(!child.has_marker(&Marker::new(2, "key".to_string())));
    }

    #[test]
    fn force_flag_is_derived_not_mutated() {
        let ctx = RequestContext::default();
        assert!(!ctx.should_force());
        assert!(ctx.forced().should_force());
        assert!(!ctx.should_force());
    }
}
