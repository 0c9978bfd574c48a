//! Request path to algorithm routing.
//!
//! Front ends that expose one endpoint per algorithm select the variant by
//! request path. A [`RouteTable`] resolves a path to a [`Variant`], trying
//! exact paths first and then glob patterns in insertion order.
//!
//! # Example
//!
//! ```ignore
//! use admit_ratelimit::{RouteTable, Variant};
//!
//! let routes = RouteTable::new()
//!     .route("/login", Variant::TokenBucket)
//!     .route_pattern("/api/**", Variant::SlidingWindow);
//!
//! assert_eq!(routes.resolve("/api/users/7"), Some(Variant::SlidingWindow));
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::algorithm::Variant;

/// One configured route.
///
/// A `path` containing `*` is treated as a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Exact path or glob pattern.
    pub path: String,
    /// Algorithm applied to matching requests.
    pub variant: Variant,
}

impl RouteRule {
    /// Create a new route rule.
    pub fn new(path: impl Into<String>, variant: Variant) -> Self {
        Self {
            path: path.into(),
            variant,
        }
    }

    fn is_pattern(&self) -> bool {
        self.path.contains('*')
    }
}

/// Path to variant lookup.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, Variant>,
    patterns: Vec<(String, Variant)>,
}

impl RouteTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// One route per variant, named after its tag (`/fixed-window`,
    /// `/sliding-window`, `/token-bucket`).
    pub fn with_defaults() -> Self {
        Variant::ALL
            .into_iter()
            .fold(Self::new(), |table, variant| {
                table.route(format!("/{}", variant), variant)
            })
    }

    /// Build a table from configured rules.
    pub fn from_rules<'a>(rules: impl IntoIterator<Item = &'a RouteRule>) -> Self {
        rules.into_iter().fold(Self::new(), |table, rule| {
            if rule.is_pattern() {
                table.route_pattern(rule.path.clone(), rule.variant)
            } else {
                table.route(rule.path.clone(), rule.variant)
            }
        })
    }

    /// Add an exact path.
    pub fn route(mut self, path: impl Into<String>, variant: Variant) -> Self {
        self.routes.insert(path.into(), variant);
        self
    }

    /// Add a route pattern.
    ///
    /// Patterns support `*` for single segment and `**` for multiple segments.
    pub fn route_pattern(mut self, pattern: impl Into<String>, variant: Variant) -> Self {
        self.patterns.push((pattern.into(), variant));
        self
    }

    /// Get the variant for a path.
    pub fn resolve(&self, path: &str) -> Option<Variant> {
        // Exact match first
        if let Some(variant) = self.routes.get(path) {
            return Some(*variant);
        }

        self.patterns
            .iter()
            .find(|(pattern, _)| pattern_matches(pattern, path))
            .map(|(_, variant)| *variant)
    }

    /// Number of routes and patterns.
    pub fn len(&self) -> usize {
        self.routes.len() + self.patterns.len()
    }

    /// Whether the table has no routes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Check if a pattern matches a path.
///
/// Simple glob-style matching:
/// - `*` matches any single path segment
/// - `**` matches any number of segments
fn pattern_matches(pattern: &str, path: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let mut pi = 0;
    let mut pa = 0;

    while pi < pattern_parts.len() {
        match pattern_parts[pi] {
            // ** swallows the rest of the path, including nothing
            "**" => return true,
            _ if pa == path_parts.len() => return false,
            "*" => {}
            segment if segment == path_parts[pa] => {}
            _ => return false,
        }
        pi += 1;
        pa += 1;
    }

    pa == path_parts.len()
}
