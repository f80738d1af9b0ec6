//! # Inventory View
//!
//! What the kiosk shows before a member picks a basket: enabled products
//! grouped by category, each with its last reported stock and whether its
//! dispenser is currently reachable.

use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;

use fbox_core::{Category, Device, Money};

use crate::error::RentalResult;
use crate::service::RentalService;

#[derive(Debug, Clone, Serialize)]
pub struct InventoryItem {
    pub product_id: String,
    pub name: String,
    pub size: String,
    pub price: Money,
    pub stock: i64,
    pub device_id: Option<String>,
    /// Bound device has a heartbeat inside the liveness window.
    pub online: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryInventory {
    pub category: Category,
    pub items: Vec<InventoryItem>,
}

impl RentalService {
    /// Enabled products grouped by category, in [`Category::ALL`] order.
    /// Categories with no products are omitted.
    pub async fn inventory_status(&self) -> RentalResult<Vec<CategoryInventory>> {
        let now = Utc::now();
        let products = self.db.products().list().await?;
        let devices: HashMap<String, Device> = self
            .db
            .devices()
            .list()
            .await?
            .into_iter()
            .map(|d| (d.device_id.clone(), d))
            .collect();

        let mut grouped: HashMap<Category, Vec<InventoryItem>> = HashMap::new();
        for product in products {
            let online = product
                .device_id
                .as_deref()
                .and_then(|id| devices.get(id))
                .map(|d| d.is_online(now, self.config.liveness_window))
                .unwrap_or(false);

            grouped.entry(product.category).or_default().push(InventoryItem {
                price: product.price(),
                product_id: product.product_id,
                name: product.name,
                size: product.size,
                stock: product.stock,
                device_id: product.device_id,
                online,
            });
        }

        Ok(Category::ALL
            .iter()
            .filter_map(|category| {
                grouped.remove(category).map(|items| CategoryInventory {
                    category: *category,
                    items,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use fbox_core::{DispenseOutcome, Product};
    use fbox_db::{BootAnnouncement, Database, DbConfig};
    use fbox_link::{Command, Dispenser, LinkResult};

    use crate::service::RentalConfig;

    struct Idle;

    #[async_trait]
    impl Dispenser for Idle {
        async fn dispense_and_wait(&self, _device_id: &str, _timeout: Duration) -> DispenseOutcome {
            DispenseOutcome::Confirmed { reported_stock: None }
        }

        async fn send_command(&self, _device_id: &str, _command: &Command) -> LinkResult<()> {
            Ok(())
        }
    }

    fn product(id: &str, category: Category, device_id: Option<&str>, enabled: bool) -> Product {
        Product {
            product_id: id.to_string(),
            category,
            size: "L".to_string(),
            name: id.to_string(),
            price: 1000,
            device_id: device_id.map(str::to_string),
            stock: 4,
            enabled,
            display_order: 0,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_grouped_in_category_order_with_online_flag() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.products()
            .upsert(&product("P-TOWEL-F", Category::Towel, None, true))
            .await
            .unwrap();
        db.products()
            .upsert(&product("P-TOP-L", Category::Top, Some("FBOX-0001"), true))
            .await
            .unwrap();
        db.products()
            .upsert(&product("P-TOP-XL", Category::Top, Some("FBOX-0009"), false))
            .await
            .unwrap();
        db.devices()
            .register(&BootAnnouncement {
                device_id: "FBOX-0001".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let service = RentalService::new(db, Arc::new(Idle), RentalConfig::default());
        let inventory = service.inventory_status().await.unwrap();

        let categories: Vec<_> = inventory.iter().map(|c| c.category).collect();
        assert_eq!(categories, vec![Category::Top, Category::Towel]);

        assert_eq!(inventory[0].items.len(), 1);
        assert!(inventory[0].items[0].online);
        assert_eq!(inventory[0].items[0].stock, 4);
        assert!(!inventory[1].items[0].online);
    }
}
