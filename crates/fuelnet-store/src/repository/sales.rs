//! # Sales Ledger Repository
//!
//! Aggregate of every sale reported to a distributor, keyed by
//! (unit, commodity).
//!
//! ## Upsert
//! ```text
//! TRANSACCION 2 93 5   ──►  INSERT (2, 93, 5000, 1)
//!                           ON CONFLICT (unit_id, commodity)
//!                           quantity_milli += 5000, charge_count += 1
//! ```
//! The addition happens inside SQLite in one statement, so concurrent reports
//! from different pump sessions commute.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use fuelnet_core::{AggregateRow, Commodity, Liters};

use crate::error::{StoreError, StoreResult};

/// Per-commodity sum across every unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommodityTotal {
    pub commodity: Commodity,
    pub quantity: Liters,
    pub charge_count: u64,
}

#[derive(Debug, Clone)]
pub struct SalesLedgerRepository {
    pool: SqlitePool,
}

impl SalesLedgerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SalesLedgerRepository { pool }
    }

    /// Folds one reported sale into the ledger and returns the updated row.
    ///
    /// A quantity that rounds to zero milli-liters is refused so the charge
    /// count never moves without the volume.
    pub async fn record(
        &self,
        unit_id: &str,
        commodity: Commodity,
        quantity: Liters,
    ) -> StoreResult<AggregateRow> {
        let milli = quantity
            .to_milli()
            .ok_or_else(|| StoreError::corrupt("quantity", format!("{} out of range", quantity)))?;
        if milli <= 0 {
            return Err(StoreError::corrupt(
                "quantity",
                format!("{} is below one milli-liter", quantity),
            ));
        }
        let now = Utc::now();

        let row = sqlx::query(
            r#"
            INSERT INTO sales_ledger (unit_id, commodity, quantity_milli, charge_count, updated_at)
            VALUES (?1, ?2, ?3, 1, ?4)
            ON CONFLICT (unit_id, commodity) DO UPDATE SET
                quantity_milli = quantity_milli + excluded.quantity_milli,
                charge_count   = charge_count + 1,
                updated_at     = excluded.updated_at
            RETURNING unit_id, commodity, quantity_milli, charge_count, updated_at
            "#,
        )
        .bind(unit_id)
        .bind(commodity.as_str())
        .bind(milli)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let aggregate = map_row(&row)?;
        debug!(
            unit_id = %aggregate.unit_id,
            commodity = %aggregate.commodity,
            total = %aggregate.quantity,
            charges = aggregate.charge_count,
            "Sale folded into ledger"
        );
        Ok(aggregate)
    }

    /// Every row, ordered by unit then commodity name.
    pub async fn all(&self) -> StoreResult<Vec<AggregateRow>> {
        let rows = sqlx::query(
            r#"
            SELECT unit_id, commodity, quantity_milli, charge_count, updated_at
            FROM sales_ledger
            ORDER BY unit_id, commodity
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_row).collect()
    }

    /// Rows of one unit.
    pub async fn for_unit(&self, unit_id: &str) -> StoreResult<Vec<AggregateRow>> {
        let rows = sqlx::query(
            r#"
            SELECT unit_id, commodity, quantity_milli, charge_count, updated_at
            FROM sales_ledger
            WHERE unit_id = ?1
            ORDER BY commodity
            "#,
        )
        .bind(unit_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_row).collect()
    }

    /// Sums per commodity across all units, in canonical commodity order.
    pub async fn totals_by_commodity(&self) -> StoreResult<Vec<CommodityTotal>> {
        let rows = sqlx::query(
            r#"
            SELECT commodity,
                   SUM(quantity_milli) AS quantity_milli,
                   SUM(charge_count)   AS charge_count
            FROM sales_ledger
            GROUP BY commodity
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut totals = rows
            .iter()
            .map(|row| -> StoreResult<CommodityTotal> {
                Ok(CommodityTotal {
                    commodity: parse_commodity(row)?,
                    quantity: Liters::from_milli(row.try_get("quantity_milli")?),
                    charge_count: row.try_get::<i64, _>("charge_count")? as u64,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;
        totals.sort_by_key(|t| t.commodity);
        Ok(totals)
    }
}

fn parse_commodity(row: &SqliteRow) -> StoreResult<Commodity> {
    let name: String = row.try_get("commodity")?;
    name.parse()
        .map_err(|_| StoreError::corrupt("ledger row", format!("unknown commodity '{}'", name)))
}

fn map_row(row: &SqliteRow) -> StoreResult<AggregateRow> {
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
    Ok(AggregateRow {
        unit_id: row.try_get("unit_id")?,
        commodity: parse_commodity(row)?,
        quantity: Liters::from_milli(row.try_get("quantity_milli")?),
        charge_count: row.try_get::<i64, _>("charge_count")? as u64,
        updated_at,
    })
}
