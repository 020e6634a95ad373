//! # Price Repository
//!
//! The distributor's cached copy of the company price table. Written before
//! every fan-out so a pump that connects later still gets the latest price.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use fuelnet_core::{Commodity, Price, PriceTable};

use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct PriceRepository {
    pool: SqlitePool,
}

impl PriceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        PriceRepository { pool }
    }

    /// Inserts or replaces one price.
    pub async fn upsert(&self, commodity: Commodity, price: Price) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO fuel_prices (commodity, price, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (commodity) DO UPDATE SET
                price = excluded.price,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(commodity.as_str())
        .bind(price.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        debug!(%commodity, %price, "Price cached");
        Ok(())
    }

    /// Stored prices on top of `defaults`.
    pub async fn load_or(&self, defaults: PriceTable) -> StoreResult<PriceTable> {
        let rows = sqlx::query("SELECT commodity, price FROM fuel_prices")
            .fetch_all(&self.pool)
            .await?;

        let mut table = defaults;
        for row in rows {
            let name: String = row.try_get("commodity")?;
            let raw: String = row.try_get("price")?;
            let commodity: Commodity = name
                .parse()
                .map_err(|_| StoreError::corrupt("price row", format!("unknown commodity '{}'", name)))?;
            let price: Price = raw
                .parse()
                .map_err(|_| StoreError::corrupt("price row", format!("bad price '{}'", raw)))?;
            table.set(commodity, price);
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn test_empty_table_gives_defaults() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let defaults = PriceTable::uniform(Price::from_whole(100));
        assert_eq!(db.prices().load_or(defaults.clone()).await.unwrap(), defaults);
    }

    #[tokio::test]
    async fn test_upsert_overrides_default() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.prices();
        repo.upsert(Commodity::Diesel, Price::from_whole(900)).await.unwrap();
        repo.upsert(Commodity::Diesel, Price::from_whole(950)).await.unwrap();

        let table = repo
            .load_or(PriceTable::uniform(Price::from_whole(100)))
            .await
            .unwrap();
        assert_eq!(table.get(Commodity::Diesel), Some(Price::from_whole(950)));
        assert_eq!(table.get(Commodity::Gasoline93), Some(Price::from_whole(100)));
    }
}
