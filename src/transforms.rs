//! Lazily applied document transforms.
//!
//! Stored documents are immutable, but erroneous metadata happens. A
//! transform is a pure function that shadows a stored document with a
//! repaired copy at read time; nothing propagates back to storage. This is
//! intended for quick, temporary fixes that may later be applied
//! permanently to the data at rest (e.g. via a database migration).
//!
//! Transforms are configured once at catalog construction, compiled into a
//! [`Transforms`] set, and applied at read boundaries only: start/stop on
//! run access, descriptors on stream access, resources in the filler.
//! Only the keys `start`, `stop`, `descriptor`, and `resource` are
//! accepted.

use std::sync::Arc;

use crate::document::{Document, EventDescriptor, Resource, RunStart, RunStop};
use crate::error::{CatalogError, CatalogResult};

/// A pure document-to-document repair function.
pub type DocumentTransform = Arc<dyn Fn(Document) -> Document + Send + Sync>;

/// The compiled transform set. Cheap to clone; immutable after catalog
/// construction.
#[derive(Clone, Default)]
pub struct Transforms {
    start: Option<DocumentTransform>,
    stop: Option<DocumentTransform>,
    descriptor: Option<DocumentTransform>,
    resource: Option<DocumentTransform>,
}

impl Transforms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transform under one of the supported document kinds.
    pub fn insert(&mut self, key: &str, transform: DocumentTransform) -> CatalogResult<()> {
        match key {
            "start" => self.start = Some(transform),
            "stop" => self.stop = Some(transform),
            "descriptor" => self.descriptor = Some(transform),
            "resource" => self.resource = Some(transform),
            other => return Err(CatalogError::UnsupportedTransformKey(other.to_string())),
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_none()
            && self.stop.is_none()
            && self.descriptor.is_none()
            && self.resource.is_none()
    }

    pub fn apply_start(&self, doc: RunStart) -> RunStart {
        match &self.start {
            Some(transform) => match transform(Document::Start(doc.clone())) {
                Document::Start(repaired) => repaired,
                _ => doc,
            },
            None => doc,
        }
    }

    pub fn apply_stop(&self, doc: RunStop) -> RunStop {
        match &self.stop {
            Some(transform) => match transform(Document::Stop(doc.clone())) {
                Document::Stop(repaired) => repaired,
                _ => doc,
            },
            None => doc,
        }
    }

    pub fn apply_descriptor(&self, doc: EventDescriptor) -> EventDescriptor {
        match &self.descriptor {
            Some(transform) => match transform(Document::Descriptor(doc.clone())) {
                Document::Descriptor(repaired) => repaired,
                _ => doc,
            },
            None => doc,
        }
    }

    pub fn apply_resource(&self, doc: Resource) -> Resource {
        match &self.resource {
            Some(transform) => match transform(Document::Resource(doc.clone())) {
                Document::Resource(repaired) => repaired,
                _ => doc,
            },
            None => doc,
        }
    }
}

impl std::fmt::Debug for Transforms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transforms")
            .field("start", &self.start.is_some())
            .field("stop", &self.stop.is_some())
            .field("descriptor", &self.descriptor.is_some())
            .field("resource", &self.resource.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unsupported_key_rejected() {
        let mut transforms = Transforms::new();
        let err = transforms
            .insert("event", Arc::new(|doc| doc))
            .unwrap_err();
        assert!(matches!(err, CatalogError::UnsupportedTransformKey(_)));
    }

    #[test]
    fn test_start_transform_shadows_on_read() {
        let mut transforms = Transforms::new();
        transforms
            .insert(
                "start",
                Arc::new(|doc| match doc {
                    Document::Start(mut start) => {
                        start
                            .extra
                            .insert("repaired".to_string(), json!(true));
                        Document::Start(start)
                    }
                    other => other,
                }),
            )
            .unwrap();
        let original = RunStart::new(1);
        let repaired = transforms.apply_start(original.clone());
        assert_eq!(repaired.extra.get("repaired"), Some(&json!(true)));
        // Applying again yields an equal document (idempotent repair).
        let twice = transforms.apply_start(repaired.clone());
        assert_eq!(twice, repaired);
    }

    #[test]
    fn test_missing_transform_is_identity() {
        let transforms = Transforms::new();
        let stop = RunStop::new("r", crate::document::ExitStatus::Success);
        assert_eq!(transforms.apply_stop(stop.clone()), stop);
    }
}
