//! Process-wide map from document name to [`SharedDocument`].
//!
//! The map lock only guards lookups and insertions; document operations run
//! under each document's own guard, so documents never contend with each
//! other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::document::SharedDocument;

/// Registry of live documents, created lazily on first reference.
pub struct DocumentRegistry {
    documents: RwLock<HashMap<String, Arc<SharedDocument>>>,
    gc: bool,
}

impl DocumentRegistry {
    /// Create an empty registry. `gc` is passed to every new replica.
    pub fn new(gc: bool) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            gc,
        }
    }

    /// Get the document called `name`, creating an empty one if needed.
    pub async fn get_or_create(&self, name: &str) -> Arc<SharedDocument> {
        // Fast path: read lock
        {
            let documents = self.documents.read().await;
            if let Some(doc) = documents.get(name) {
                return doc.clone();
            }
        }

        let mut documents = self.documents.write().await;
        // Double-check after acquiring write lock
        if let Some(doc) = documents.get(name) {
            return doc.clone();
        }

        let doc = Arc::new(SharedDocument::new(name, self.gc));
        documents.insert(name.to_string(), doc.clone());
        log::info!("Created document {name}");
        doc
    }

    pub async fn get(&self, name: &str) -> Option<Arc<SharedDocument>> {
        self.documents.read().await.get(name).cloned()
    }

    /// Remove documents that have had no connections for at least `grace`.
    ///
    /// A document still referenced outside the registry (a connection task
    /// between lookup and registration, for instance) is never evicted.
    /// Returns the evicted names.
    pub async fn evict_idle(&self, grace: Duration) -> Vec<String> {
        let mut documents = self.documents.write().await;
        let mut evicted = Vec::new();

        documents.retain(|name, doc| {
            if Arc::strong_count(doc) > 1 {
                return true;
            }
            let idle = doc
                .try_lock()
                .and_then(|state| state.idle_since())
                .is_some_and(|since| since.elapsed() >= grace);
            if idle {
                evicted.push(name.clone());
            }
            !idle
        });

        for name in &evicted {
            log::info!("Evicted idle document {name}");
        }
        evicted
    }

    /// Number of documents currently held.
    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }

    pub async fn names(&self) -> Vec<String> {
        self.documents.read().await.keys().cloned().collect()
    }
}

impl Default for DocumentRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHandle;

    #[tokio::test]
    async fn test_same_name_same_instance() {
        let registry = DocumentRegistry::default();
        let first = registry.get_or_create("room1").await;
        let second = registry.get_or_create("room1").await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_documents_are_isolated_by_name() {
        let registry = DocumentRegistry::default();
        let a = registry.get_or_create("a").await;
        let b = registry.get_or_create("b").await;

        assert!(!Arc::ptr_eq(&a, &b));
        let mut names = registry.names().await;
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_yields_one_document() {
        let registry = Arc::new(DocumentRegistry::default());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move { registry.get_or_create("shared").await }));
        }
        let mut docs = Vec::new();
        for task in tasks {
            docs.push(task.await.unwrap());
        }
        assert!(docs.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_evict_idle_skips_referenced_documents() {
        let registry = DocumentRegistry::default();
        let held = registry.get_or_create("held").await;
        drop(registry.get_or_create("dropped").await);

        let evicted = registry.evict_idle(Duration::ZERO).await;
        assert_eq!(evicted, vec!["dropped".to_string()]);
        assert!(registry.get("held").await.is_some());
        assert!(registry.get("dropped").await.is_none());
        drop(held);
    }

    #[tokio::test]
    async fn test_evict_idle_respects_grace_and_connections() {
        let registry = DocumentRegistry::default();
        {
            let doc = registry.get_or_create("busy").await;
            let (conn, _rx) = ConnectionHandle::new(4);
            doc.lock().await.add_connection(conn);
        }
        drop(registry.get_or_create("fresh").await);

        // "busy" has a connection, "fresh" is inside its grace period
        let evicted = registry.evict_idle(Duration::from_secs(3600)).await;
        assert!(evicted.is_empty());
        let evicted = registry.evict_idle(Duration::ZERO).await;
        assert_eq!(evicted, vec!["fresh".to_string()]);
        assert_eq!(registry.len().await, 1);
    }
}
