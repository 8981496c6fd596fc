//! Search queries and their translation to store-native predicates.
//!
//! A catalog accumulates query conjuncts; each [`SearchQuery`] is turned
//! into [`Filter`] predicates (or an in-memory scan predicate when the
//! store cannot help) by a translator looked up in the
//! [`QueryTranslatorRegistry`]. The built-in query types cover full-text
//! search, raw predicate passthrough, partial-uid prefix match, scan-id
//! lookup, time ranges, and comparisons on start-document metadata keys.
//! New query types register a translator under their kind tag.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::catalog::Catalog;
use crate::error::{CatalogError, CatalogResult};
use crate::store::Filter;

/// Comparison operators usable against metadata keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

/// A search over the run index.
///
/// Times are epoch seconds and ranges are half-open `[since, until)`.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchQuery {
    /// Full text search over the start document. Translated to
    /// store-native text search where available, an in-memory scan
    /// otherwise.
    FullText { text: String, case_sensitive: bool },
    /// Store-native predicate passthrough.
    Raw(Filter),
    /// Uid prefix fragments, at least 5 characters each and at most one
    /// match per fragment.
    PartialUid(Vec<String>),
    /// Scan-id equality. Indexing by scan id resolves ties newest-first.
    ScanId(Vec<i64>),
    /// Scan ids in `[start, end)`.
    ScanIdRange { start: i64, end: i64 },
    /// Start time in `[since, until)`.
    TimeRange {
        since: Option<f64>,
        until: Option<f64>,
    },
    Eq {
        key: String,
        value: Value,
    },
    NotEq {
        key: String,
        value: Value,
    },
    In {
        key: String,
        values: Vec<Value>,
    },
    NotIn {
        key: String,
        values: Vec<Value>,
    },
    Comparison {
        key: String,
        op: CmpOp,
        value: Value,
    },
    /// An extension query dispatched purely on its kind tag.
    Custom { kind: String, params: Value },
}

impl SearchQuery {
    /// The kind tag used for translator lookup.
    pub fn kind(&self) -> &str {
        match self {
            SearchQuery::FullText { .. } => "full_text",
            SearchQuery::Raw(_) => "raw",
            SearchQuery::PartialUid(_) => "partial_uid",
            SearchQuery::ScanId(_) => "scan_id",
            SearchQuery::ScanIdRange { .. } => "scan_id_range",
            SearchQuery::TimeRange { .. } => "time_range",
            SearchQuery::Eq { .. } => "eq",
            SearchQuery::NotEq { .. } => "not_eq",
            SearchQuery::In { .. } => "in",
            SearchQuery::NotIn { .. } => "not_in",
            SearchQuery::Comparison { .. } => "comparison",
            SearchQuery::Custom { kind, .. } => kind,
        }
    }
}

/// Queries address start-document fields; a leading `start.` is accepted
/// and stripped.
fn metadata_key(key: &str) -> String {
    key.strip_prefix("start.").unwrap_or(key).to_string()
}

/// Translates one query kind into a narrowed catalog.
#[async_trait]
pub trait QueryTranslator: Send + Sync {
    async fn translate(&self, query: &SearchQuery, catalog: &Catalog) -> CatalogResult<Catalog>;
}

/// Kind tag -> translator. Built-ins are installed at construction;
/// writes are rare and serialized, readers snapshot.
#[derive(Clone)]
pub struct QueryTranslatorRegistry {
    translators: Arc<RwLock<HashMap<String, Arc<dyn QueryTranslator>>>>,
}

impl QueryTranslatorRegistry {
    pub fn with_builtins() -> Self {
        let registry = Self {
            translators: Arc::new(RwLock::new(HashMap::new())),
        };
        registry.register("full_text", Arc::new(FullTextTranslator));
        registry.register("raw", Arc::new(RawTranslator));
        registry.register("partial_uid", Arc::new(PartialUidTranslator));
        registry.register("scan_id", Arc::new(ScanIdTranslator));
        registry.register("scan_id_range", Arc::new(ScanIdTranslator));
        registry.register("time_range", Arc::new(TimeRangeTranslator));
        for kind in ["eq", "not_eq", "in", "not_in", "comparison"] {
            registry.register(kind, Arc::new(KeyTranslator));
        }
        registry
    }

    pub fn register(&self, kind: &str, translator: Arc<dyn QueryTranslator>) {
        if let Ok(mut translators) = self.translators.write() {
            translators.insert(kind.to_string(), translator);
        }
    }

    pub async fn translate(
        &self,
        query: &SearchQuery,
        catalog: &Catalog,
    ) -> CatalogResult<Catalog> {
        let translator = self
            .translators
            .read()
            .ok()
            .and_then(|translators| translators.get(query.kind()).cloned())
            .ok_or_else(|| {
                CatalogError::InvalidQuery(format!(
                    "no translator registered for query kind {:?}",
                    query.kind()
                ))
            })?;
        translator.translate(query, catalog).await
    }
}

struct RawTranslator;

#[async_trait]
impl QueryTranslator for RawTranslator {
    async fn translate(&self, query: &SearchQuery, catalog: &Catalog) -> CatalogResult<Catalog> {
        match query {
            SearchQuery::Raw(filter) => Ok(catalog.with_filter(filter.clone())),
            _ => Err(CatalogError::InvalidQuery("expected raw query".to_string())),
        }
    }
}

struct FullTextTranslator;

#[async_trait]
impl QueryTranslator for FullTextTranslator {
    async fn translate(&self, query: &SearchQuery, catalog: &Catalog) -> CatalogResult<Catalog> {
        let SearchQuery::FullText {
            text,
            case_sensitive,
        } = query
        else {
            return Err(CatalogError::InvalidQuery(
                "expected full_text query".to_string(),
            ));
        };
        if catalog.store_supports_text_search() {
            Ok(catalog.with_filter(Filter::Text {
                text: text.clone(),
                case_sensitive: *case_sensitive,
            }))
        } else {
            // For a huge catalog this scan will be slow, but a store
            // without text search leaves no better option.
            let needle = if *case_sensitive {
                text.clone()
            } else {
                text.to_lowercase()
            };
            let case_sensitive = *case_sensitive;
            Ok(catalog.with_scan_predicate(Arc::new(move |start| {
                let haystack = serde_json::to_string(start).unwrap_or_default();
                if case_sensitive {
                    haystack.contains(&needle)
                } else {
                    haystack.to_lowercase().contains(&needle)
                }
            })))
        }
    }
}

struct PartialUidTranslator;

#[async_trait]
impl QueryTranslator for PartialUidTranslator {
    async fn translate(&self, query: &SearchQuery, catalog: &Catalog) -> CatalogResult<Catalog> {
        let SearchQuery::PartialUid(fragments) = query else {
            return Err(CatalogError::InvalidQuery(
                "expected partial_uid query".to_string(),
            ));
        };
        let mut alternatives = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            if fragment.len() < 5 {
                return Err(CatalogError::InvalidQuery(format!(
                    "partial uid {fragment:?} is too short; include at least 5 characters"
                )));
            }
            let filter = Filter::Prefix("uid".to_string(), fragment.clone());
            let matches = catalog.count_with(&filter).await?;
            if matches > 1 {
                return Err(CatalogError::InvalidQuery(format!(
                    "partial uid {fragment:?} has {matches} matches; include more characters"
                )));
            }
            alternatives.push(filter);
        }
        Ok(catalog.with_filter(Filter::Or(alternatives)))
    }
}

struct ScanIdTranslator;

#[async_trait]
impl QueryTranslator for ScanIdTranslator {
    async fn translate(&self, query: &SearchQuery, catalog: &Catalog) -> CatalogResult<Catalog> {
        match query {
            SearchQuery::ScanId(scan_ids) => Ok(catalog.with_filter(Filter::In(
                "scan_id".to_string(),
                scan_ids.iter().map(|id| Value::from(*id)).collect(),
            ))),
            SearchQuery::ScanIdRange { start, end } => Ok(catalog.with_filter(Filter::and(vec![
                Filter::Gte("scan_id".to_string(), Value::from(*start)),
                Filter::Lt("scan_id".to_string(), Value::from(*end)),
            ]))),
            _ => Err(CatalogError::InvalidQuery(
                "expected scan_id query".to_string(),
            )),
        }
    }
}

struct TimeRangeTranslator;

#[async_trait]
impl QueryTranslator for TimeRangeTranslator {
    async fn translate(&self, query: &SearchQuery, catalog: &Catalog) -> CatalogResult<Catalog> {
        let SearchQuery::TimeRange { since, until } = query else {
            return Err(CatalogError::InvalidQuery(
                "expected time_range query".to_string(),
            ));
        };
        if let (Some(since), Some(until)) = (since, until) {
            if since > until {
                return Err(CatalogError::InvalidQuery(
                    "since must not be greater than until".to_string(),
                ));
            }
        }
        let mut conjuncts = Vec::new();
        if let Some(since) = since {
            conjuncts.push(Filter::Gte("time".to_string(), Value::from(*since)));
        }
        if let Some(until) = until {
            conjuncts.push(Filter::Lt("time".to_string(), Value::from(*until)));
        }
        Ok(catalog.with_filter(Filter::and(conjuncts)))
    }
}

struct KeyTranslator;

#[async_trait]
impl QueryTranslator for KeyTranslator {
    async fn translate(&self, query: &SearchQuery, catalog: &Catalog) -> CatalogResult<Catalog> {
        let filter = match query {
            SearchQuery::Eq { key, value } => Filter::Eq(metadata_key(key), value.clone()),
            SearchQuery::NotEq { key, value } => Filter::Ne(metadata_key(key), value.clone()),
            SearchQuery::In { key, values } => Filter::In(metadata_key(key), values.clone()),
            SearchQuery::NotIn { key, values } => Filter::NotIn(metadata_key(key), values.clone()),
            SearchQuery::Comparison { key, op, value } => {
                let key = metadata_key(key);
                match op {
                    CmpOp::Lt => Filter::Lt(key, value.clone()),
                    CmpOp::Le => Filter::Lte(key, value.clone()),
                    CmpOp::Gt => Filter::Gt(key, value.clone()),
                    CmpOp::Ge => Filter::Gte(key, value.clone()),
                }
            }
            _ => {
                return Err(CatalogError::InvalidQuery(
                    "expected key comparison query".to_string(),
                ))
            }
        };
        Ok(catalog.with_filter(filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(SearchQuery::PartialUid(vec![]).kind(), "partial_uid");
        assert_eq!(
            SearchQuery::Custom {
                kind: "by_proposal".to_string(),
                params: Value::Null
            }
            .kind(),
            "by_proposal"
        );
    }

    #[test]
    fn test_metadata_key_strips_start_prefix() {
        assert_eq!(metadata_key("start.plan_name"), "plan_name");
        assert_eq!(metadata_key("plan_name"), "plan_name");
    }
}
