use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use larder_core::{InventoryId, ItemId, OwnerId, SharedClock, SystemClock};

use super::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    pub id: InventoryId,
    pub owner_id: OwnerId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Item to add to an inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewItem {
    pub name: String,
    pub quantity: f64,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl NewItem {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.name.trim().is_empty() {
            return Err(StoreError::Validation("item name must not be empty".into()));
        }
        if !self.quantity.is_finite() || self.quantity <= 0.0 {
            return Err(StoreError::Validation("quantity must be positive".into()));
        }
        if self.unit.trim().is_empty() {
            return Err(StoreError::Validation("unit must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: ItemId,
    pub inventory_id: InventoryId,
    pub name: String,
    pub quantity: f64,
    pub unit: String,
    pub notes: Option<String>,
    pub added_at: DateTime<Utc>,
}

/// Inventory / item records.
///
/// Inventories are private to their owner: another owner's inventory is
/// reported as `NotFound`.
#[async_trait]
pub trait InventoryStore: Send + Sync + 'static {
    async fn create_inventory(&self, owner_id: OwnerId, name: &str) -> Result<Inventory, StoreError>;

    async fn get_inventory(&self, owner_id: OwnerId, id: InventoryId) -> Result<Inventory, StoreError>;

    async fn add_item(
        &self,
        owner_id: OwnerId,
        inventory_id: InventoryId,
        item: NewItem,
    ) -> Result<InventoryItem, StoreError>;

    async fn list_items(
        &self,
        owner_id: OwnerId,
        inventory_id: InventoryId,
    ) -> Result<Vec<InventoryItem>, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    inventories: HashMap<InventoryId, Inventory>,
    items: HashMap<InventoryId, Vec<InventoryItem>>,
}

pub struct InMemoryInventoryStore {
    tables: RwLock<Tables>,
    clock: SharedClock,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            clock,
        }
    }
}

impl Default for InMemoryInventoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn owned<'a>(
    tables: &'a Tables,
    owner_id: OwnerId,
    id: InventoryId,
) -> Result<&'a Inventory, StoreError> {
    tables
        .inventories
        .get(&id)
        .filter(|inv| inv.owner_id == owner_id)
        .ok_or_else(|| StoreError::NotFound(format!("inventory {id}")))
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn create_inventory(&self, owner_id: OwnerId, name: &str) -> Result<Inventory, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::Validation("inventory name must not be empty".into()));
        }

        let mut tables = self.tables.write();
        let duplicate = tables
            .inventories
            .values()
            .any(|inv| inv.owner_id == owner_id && inv.name.eq_ignore_ascii_case(name));
        if duplicate {
            return Err(StoreError::Conflict(format!("inventory '{name}' already exists")));
        }

        let inventory = Inventory {
            id: InventoryId::new(),
            owner_id,
            name: name.to_string(),
            created_at: self.clock.now(),
        };
        tables.inventories.insert(inventory.id, inventory.clone());
        Ok(inventory)
    }

    async fn get_inventory(&self, owner_id: OwnerId, id: InventoryId) -> Result<Inventory, StoreError> {
        owned(&self.tables.read(), owner_id, id).cloned()
    }

    async fn add_item(
        &self,
        owner_id: OwnerId,
        inventory_id: InventoryId,
        item: NewItem,
    ) -> Result<InventoryItem, StoreError> {
        item.validate()?;

        let mut tables = self.tables.write();
        owned(&tables, owner_id, inventory_id)?;

        let record = InventoryItem {
            id: ItemId::new(),
            inventory_id,
            name: item.name.trim().to_string(),
            quantity: item.quantity,
            unit: item.unit,
            notes: item.notes,
            added_at: self.clock.now(),
        };
        tables.items.entry(inventory_id).or_default().push(record.clone());
        Ok(record)
    }

    async fn list_items(
        &self,
        owner_id: OwnerId,
        inventory_id: InventoryId,
    ) -> Result<Vec<InventoryItem>, StoreError> {
        let tables = self.tables.read();
        owned(&tables, owner_id, inventory_id)?;
        Ok(tables.items.get(&inventory_id).cloned().unwrap_or_default())
    }
}
