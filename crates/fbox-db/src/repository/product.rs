//! # Product Repository
//!
//! Rentable products, one per dispenser slot.
//!
//! ## Product / Device Binding
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  products.device_id is UNIQUE: a device backs at most one product.     │
//! │                                                                         │
//! │  P-TOP-L  ──► FBOX-A1B2   stock mirrored from the device's reports     │
//! │  P-PANTS-M ─► FBOX-C3D4                                                │
//! │  P-TOWEL-F ─► (unbound)   not rentable until a device claims it        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::pool::WriteLock;
use fbox_core::Product;

const PRODUCT_COLUMNS: &str = "product_id, category, size, name, price, device_id, stock, \
                               enabled, display_order, updated_at";

/// Repository for product database operations.
///
/// ## Usage
/// ```rust,ignore
/// let product = db.products().get("P-TOP-L").await?;
/// db.products().update_stock("P-TOP-L", 9).await?;
/// ```
#[derive(Debug, Clone)]
pub struct ProductRepository {
    pool: SqlitePool,
    write_lock: WriteLock,
}

impl ProductRepository {
    /// Creates a new ProductRepository.
    pub fn new(pool: SqlitePool, write_lock: WriteLock) -> Self {
        ProductRepository { pool, write_lock }
    }

    /// Gets a product by its ID.
    pub async fn get(&self, product_id: &str) -> DbResult<Option<Product>> {
        let product = sqlx::query_as::<_, Product>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE product_id = ?1"
        ))
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(product)
    }

    /// Gets the product a device is bound to.
    pub async fn get_by_device(&self, device_id: &str) -> DbResult<Option<Product>> {
        let product = sqlx::query_as::<_, Product>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE device_id = ?1"
        ))
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(product)
    }

    /// Lists enabled products in display order.
    pub async fn list(&self) -> DbResult<Vec<Product>> {
        let products = sqlx::query_as::<_, Product>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE enabled = 1 \
             ORDER BY display_order, category, size"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(products)
    }

    /// Inserts or replaces a product.
    pub async fn upsert(&self, product: &Product) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        debug!(product_id = %product.product_id, device_id = ?product.device_id, "Upserting product");

        sqlx::query(
            r#"
            INSERT INTO products
                (product_id, category, size, name, price, device_id, stock, enabled, display_order, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(product_id) DO UPDATE SET
                category = excluded.category,
                size = excluded.size,
                name = excluded.name,
                price = excluded.price,
                device_id = excluded.device_id,
                stock = excluded.stock,
                enabled = excluded.enabled,
                display_order = excluded.display_order,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&product.product_id)
        .bind(product.category)
        .bind(&product.size)
        .bind(&product.name)
        .bind(product.price)
        .bind(&product.device_id)
        .bind(product.stock)
        .bind(product.enabled)
        .bind(product.display_order)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Sets a product's stock to an absolute value.
    pub async fn update_stock(&self, product_id: &str, stock: i64) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query("UPDATE products SET stock = ?1, updated_at = ?2 WHERE product_id = ?3")
            .bind(stock)
            .bind(Utc::now())
            .bind(product_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Product", product_id));
        }

        debug!(product_id = %product_id, stock, "Product stock updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::repository::fixtures;
    use crate::DbError;
    use fbox_core::Category;

    #[tokio::test]
    async fn test_device_binding_lookup() {
        let db = fixtures::db().await;
        db.products()
            .upsert(&fixtures::product("P-TOP-L", Category::Top, 1000, Some("FBOX-01")))
            .await
            .unwrap();

        let bound = db.products().get_by_device("FBOX-01").await.unwrap().unwrap();
        assert_eq!(bound.product_id, "P-TOP-L");
        assert_eq!(bound.category, Category::Top);
        assert!(db.products().get_by_device("FBOX-99").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_device_per_product() {
        let db = fixtures::db().await;
        let products = db.products();
        products
            .upsert(&fixtures::product("P-TOP-L", Category::Top, 1000, Some("FBOX-01")))
            .await
            .unwrap();

        let err = products
            .upsert(&fixtures::product("P-TOP-M", Category::Top, 1000, Some("FBOX-01")))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn test_update_stock() {
        let db = fixtures::seeded().await;
        db.products().update_stock("P-TOP-L", 3).await.unwrap();
        assert_eq!(db.products().get("P-TOP-L").await.unwrap().unwrap().stock, 3);

        let err = db.products().update_stock("P-NONE", 3).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }
}
