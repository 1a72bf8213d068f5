use std::sync::Arc;

use crate::models::{BoughtItem, VehicleUpdate};
use crate::store::{bought_items_path, vehicle_updates_path, DocumentStore, Query};

/// Line items hanging off one record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Children {
    pub bought_items: Vec<BoughtItem>,
    pub vehicle_update: Option<VehicleUpdate>,
}

#[derive(Clone)]
pub struct SubcollectionLoader {
    store: Arc<dyn DocumentStore>,
}

impl SubcollectionLoader {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Load both subcollections concurrently. Either side failing yields an
    /// empty list / `None` for that side only.
    pub async fn load(&self, record_id: &str) -> Children {
        let (bought_items, vehicle_update) =
            futures::join!(self.bought_items(record_id), self.vehicle_update(record_id));
        Children {
            bought_items,
            vehicle_update,
        }
    }

    async fn bought_items(&self, record_id: &str) -> Vec<BoughtItem> {
        match self
            .store
            .get_many(Query::collection(bought_items_path(record_id)))
            .await
        {
            Ok(docs) => docs.iter().map(|d| BoughtItem::from_fields(&d.fields)).collect(),
            Err(e) => {
                log::debug!("bought_items for {record_id} unavailable: {e}");
                Vec::new()
            }
        }
    }

    /// First update wins when several exist.
    // TODO: confirm whether multiple vehicle updates per record are a real multi-trip case.
    async fn vehicle_update(&self, record_id: &str) -> Option<VehicleUpdate> {
        match self
            .store
            .get_many(Query::collection(vehicle_updates_path(record_id)))
            .await
        {
            Ok(docs) => docs.first().map(|d| VehicleUpdate::from_fields(&d.fields)),
            Err(e) => {
                log::debug!("vehicle_updates for {record_id} unavailable: {e}");
                None
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
    async fn test_loads_items_and_first_vehicle_update() {
        let store = MemoryStore::new();
        store.insert(&bought_items_path("r1"), "i1", json!({"itemName": "Urea", "totalCost": 30}));
        store.insert(&bought_items_path("r1"), "i2", json!({"itemName": "Potash", "total": 20}));
        store.insert(&vehicle_updates_path("r1"), "v1", json!({"vehicleType": "Truck", "fuelCost": 10}));
        store.insert(&vehicle_updates_path("r1"), "v2", json!({"vehicleType": "Tractor"}));

        let children = SubcollectionLoader::new(Arc::new(store)).load("r1").await;
        assert_eq!(children.bought_items.len(), 2);
        let vehicle = children.vehicle_update.unwrap();
        assert_eq!(vehicle.vehicle_type.as_deref(), Some("Truck"));
    }

    #[tokio::test]
    async fn test_one_side_failing_keeps_the_other() {
        let store = MemoryStore::new();
        store.insert(&bought_items_path("r1"), "i1", json!({"totalCost": 30}));
        store.insert(&vehicle_updates_path("r1"), "v1", json!({"fuelCost": 10}));
        store.fail_reads(&bought_items_path("r1"), StoreError::PermissionDenied("items".into()));

        let children = SubcollectionLoader::new(Arc::new(store)).load("r1").await;
        assert!(children.bought_items.is_empty());
        assert!(children.vehicle_update.is_some());
    }

    #[tokio::test]
    async fn test_no_children() {
        let store = MemoryStore::new();
        let children = SubcollectionLoader::new(Arc::new(store)).load("r1").await;
        assert_eq!(children, Children::default());
    }
}
