//! Access policy hook.
//!
//! The core itself does no authentication; an optional policy object can
//! rewrite a catalog's query conjuncts based on the caller identity, so
//! every subsequent listing and lookup is transparently restricted. The
//! admin sentinel bypasses rewriting entirely. `AccessDenied` errors
//! originate in policies, never in the core.

use serde_json::Value;
use std::collections::HashMap;

use crate::error::{CatalogError, CatalogResult};
use crate::store::Filter;

/// The caller on whose behalf a catalog is being read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Sentinel that bypasses query modification.
    Admin,
    User(String),
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identity::Admin => f.write_str("admin"),
            Identity::User(name) => f.write_str(name),
        }
    }
}

/// Optional query rewriter keyed on caller identity.
pub trait AccessPolicy: Send + Sync {
    /// Whether this policy can work with the given catalog shape at all.
    fn check_compatibility(&self, _catalog: &crate::catalog::Catalog) -> bool {
        true
    }

    /// Return the query conjuncts for `identity`, given the conjuncts
    /// accumulated so far. The admin identity never reaches this method.
    fn modify_queries(
        &self,
        queries: &[Filter],
        identity: &Identity,
    ) -> CatalogResult<Vec<Filter>>;
}

/// What one principal may see.
#[derive(Debug, Clone, PartialEq)]
pub enum AccessList {
    /// Unrestricted access.
    All,
    /// Only runs whose policy key takes one of these values.
    Values(Vec<Value>),
}

/// Allow-list policy: a mapping of user names to the entries they can
/// access, compared against a configurable start-document key (typically
/// `uid` or a proposal/session field).
pub struct SimpleAccessPolicy {
    access_lists: HashMap<String, AccessList>,
    key: String,
}

impl SimpleAccessPolicy {
    pub fn new(access_lists: HashMap<String, AccessList>, key: &str) -> Self {
        Self {
            access_lists,
            key: key.to_string(),
        }
    }
}

impl AccessPolicy for SimpleAccessPolicy {
    fn modify_queries(
        &self,
        queries: &[Filter],
        identity: &Identity,
    ) -> CatalogResult<Vec<Filter>> {
        let name = match identity {
            Identity::Admin => return Ok(queries.to_vec()),
            Identity::User(name) => name,
        };
        let mut modified = queries.to_vec();
        match self.access_lists.get(name) {
            Some(AccessList::All) => {}
            Some(AccessList::Values(values)) => {
                modified.push(Filter::In(self.key.clone(), values.clone()));
            }
            None => {
                return Err(CatalogError::AccessDenied {
                    identity: identity.to_string(),
                })
            }
        }
        Ok(modified)
    }
}
