use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::models::{field_display_name, UNKNOWN_FIELD};
use crate::store::{DocumentStore, FIELDS};

/// Field id -> display name. One instance per record-store session; never evicts.
#[derive(Debug, Clone, Default)]
pub struct NameCache {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl NameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field_id: &str) -> Option<String> {
        self.lock().get(field_id).cloned()
    }

    pub fn insert(&self, field_id: &str, name: &str) {
        self.lock().insert(field_id.to_string(), name.to_string());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A poisoned map still holds valid names.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct FieldNameResolver {
    store: Arc<dyn DocumentStore>,
    cache: NameCache,
}

impl FieldNameResolver {
    pub fn new(store: Arc<dyn DocumentStore>, cache: NameCache) -> Self {
        Self { store, cache }
    }

    pub fn cache(&self) -> &NameCache {
        &self.cache
    }

    /// Display name for a field. Failures degrade to "Unknown Field" and are not cached.
    pub async fn resolve(&self, field_id: &str) -> String {
        if let Some(name) = self.cache.get(field_id) {
            return name;
        }
        match self.store.get_one(FIELDS, field_id).await {
            Ok(Some(doc)) => match field_display_name(&doc.fields) {
                Some(name) => {
                    self.cache.insert(field_id, &name);
                    name
                }
                None => UNKNOWN_FIELD.to_string(),
            },
            Ok(None) => UNKNOWN_FIELD.to_string(),
            Err(e) => {
                log::debug!("Error fetching field {field_id}: {e}");
                UNKNOWN_FIELD.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::StoreError;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolves_and_caches() {
        let store = MemoryStore::new();
        store.insert(FIELDS, "f1", json!({"field_name": "North Block"}));
        let resolver = FieldNameResolver::new(Arc::new(store.clone()), NameCache::new());

        assert_eq!(resolver.resolve("f1").await, "North Block");
        store.remove(FIELDS, "f1");
        assert_eq!(resolver.resolve("f1").await, "North Block");
        assert_eq!(resolver.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_name_and_fetch_failure_use_sentinel() {
        let store = MemoryStore::new();
        store.insert(FIELDS, "f2", json!({"area": 3}));
        store.fail_reads(FIELDS, StoreError::Unavailable("offline".into()));
        let resolver = FieldNameResolver::new(Arc::new(store.clone()), NameCache::new());
        assert_eq!(resolver.resolve("f2").await, UNKNOWN_FIELD);

        store.clear_failures();
        assert_eq!(resolver.resolve("f2").await, UNKNOWN_FIELD);
        assert_eq!(resolver.resolve("missing").await, UNKNOWN_FIELD);
        assert!(resolver.cache().is_empty());
    }

    #[tokio::test]
    async fn test_independent_caches() {
        let store = MemoryStore::new();
        store.insert(FIELDS, "f1", json!({"fieldName": "East"}));
        let a = FieldNameResolver::new(Arc::new(store.clone()), NameCache::new());
        let b = FieldNameResolver::new(Arc::new(store), NameCache::new());
        a.resolve("f1").await;
        assert_eq!(a.cache().len(), 1);
        assert!(b.cache().is_empty());
    }
}
