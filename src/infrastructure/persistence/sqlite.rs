//! Sqlite store (sqlx)
//!
//! The authoritative relational store: entities, versions, sync runs,
//! checkpoints, queue rows, schedule state and leader leases all live here.
//! Timestamps are bound as `DateTime<Utc>` (RFC 3339 text in sqlite), which
//! keeps SQL comparisons consistent with the Rust side.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::entities::{
    BusinessType, ContactInfo, ImageKind, ImageStatus, Product, ProductImage, ProductStatus,
    Supplier, SyncStatus,
};
use crate::domain::repositories::{
    Checkpoint, CheckpointRepository, ImageRepository, LeaderLeaseRepository, ProductFilter,
    ProductRepository, ScheduleStateRepository, Store, SupplierRepository, SyncRunRepository,
    UpsertOutcome, VersionRepository,
};
use crate::domain::sync_run::{
    OperationType, SyncCounters, SyncRun, SyncRunStatus, SyncType,
};
use crate::domain::version::{ChangeKind, EntityType, VersionRecord};
use crate::queue::work::{LeasedWork, Priority, QueuedWork, WorkId, WorkLease};
use crate::queue::{EnqueueRequest, QueueDepth, QueueError, WorkQueue};

/// Sqlite-backed implementation of the persistence port and the work queue
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if necessary) the database at `db_url`
    pub async fn connect(db_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid database url {db_url}"))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create every table and index. Idempotent.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .context("initializing schema")?;
        Ok(())
    }

    /// Bundle into the capability set handed to components
    pub fn into_store(self) -> Store {
        let shared = std::sync::Arc::new(self);
        Store {
            products: shared.clone(),
            suppliers: shared.clone(),
            images: shared.clone(),
            versions: shared.clone(),
            sync_runs: shared.clone(),
            checkpoints: shared.clone(),
            leases: shared.clone(),
            schedule_state: shared,
        }
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS products (
    source_id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    subtitle TEXT,
    description TEXT,
    price_min REAL,
    price_max REAL,
    currency TEXT NOT NULL DEFAULT 'CNY',
    moq INTEGER,
    price_unit TEXT,
    main_image_url TEXT,
    detail_images TEXT NOT NULL DEFAULT '[]',
    specifications TEXT NOT NULL DEFAULT '{}',
    attributes TEXT NOT NULL DEFAULT '{}',
    supplier_source_id TEXT,
    sales_count INTEGER NOT NULL DEFAULT 0,
    review_count INTEGER NOT NULL DEFAULT 0,
    rating REAL,
    category_id TEXT,
    category_name TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    sync_status TEXT NOT NULL DEFAULT 'pending',
    last_sync_time TEXT,
    canonical_of TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_products_supplier ON products(supplier_source_id);
CREATE INDEX IF NOT EXISTS idx_products_status ON products(status, sync_status);
CREATE INDEX IF NOT EXISTS idx_products_category ON products(category_id);

CREATE TABLE IF NOT EXISTS suppliers (
    source_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    company_name TEXT,
    contact TEXT NOT NULL DEFAULT '{}',
    province TEXT,
    city TEXT,
    address TEXT,
    rating REAL,
    response_rate REAL,
    product_count INTEGER NOT NULL DEFAULT 0,
    business_type TEXT NOT NULL DEFAULT 'trader',
    main_products TEXT NOT NULL DEFAULT '[]',
    certifications TEXT NOT NULL DEFAULT '[]',
    registered_capital TEXT,
    established_date TEXT,
    verified INTEGER NOT NULL DEFAULT 0,
    verification_level TEXT,
    canonical_of TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS product_images (
    product_source_id TEXT NOT NULL,
    url TEXT NOT NULL,
    kind TEXT NOT NULL,
    order_index INTEGER NOT NULL,
    alt_text TEXT,
    file_size INTEGER,
    width INTEGER,
    height INTEGER,
    status TEXT NOT NULL DEFAULT 'pending',
    object_key TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (product_source_id, kind, order_index)
);
CREATE INDEX IF NOT EXISTS idx_images_object_key ON product_images(object_key);

CREATE TABLE IF NOT EXISTS version_records (
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    version_no INTEGER NOT NULL,
    change_kind TEXT NOT NULL,
    author TEXT NOT NULL,
    created_at TEXT NOT NULL,
    checksum TEXT NOT NULL,
    snapshot TEXT NOT NULL,
    diff TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (entity_type, entity_id, version_no)
);

CREATE TABLE IF NOT EXISTS sync_runs (
    run_id TEXT PRIMARY KEY,
    task_id TEXT,
    task_name TEXT NOT NULL,
    operation_type TEXT NOT NULL,
    sync_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    progress INTEGER NOT NULL DEFAULT 0,
    total INTEGER NOT NULL DEFAULT 0,
    processed INTEGER NOT NULL DEFAULT 0,
    success INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    started_at TEXT,
    finished_at TEXT,
    error_digest TEXT NOT NULL DEFAULT '{}',
    config_snapshot TEXT NOT NULL DEFAULT 'null',
    recommendations TEXT NOT NULL DEFAULT '[]',
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    retry_of TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sync_runs_status ON sync_runs(status);
CREATE INDEX IF NOT EXISTS idx_sync_runs_task ON sync_runs(task_id);

CREATE TABLE IF NOT EXISTS checkpoints (
    task_id TEXT NOT NULL,
    sequence_no INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    cursor BLOB NOT NULL,
    counters TEXT NOT NULL,
    checksum TEXT NOT NULL,
    PRIMARY KEY (task_id, sequence_no)
);

CREATE TABLE IF NOT EXISTS queue_work (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    work_id TEXT NOT NULL UNIQUE,
    task_name TEXT NOT NULL,
    args TEXT NOT NULL DEFAULT 'null',
    queue_name TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 5,
    attempt_no INTEGER NOT NULL DEFAULT 0,
    not_before TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    lease_token TEXT,
    lease_worker TEXT,
    lease_deadline TEXT,
    last_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_queue_pop ON queue_work(queue_name, priority, not_before, id);

CREATE TABLE IF NOT EXISTS queue_dead_letter (
    work_id TEXT PRIMARY KEY,
    task_name TEXT NOT NULL,
    args TEXT NOT NULL,
    queue_name TEXT NOT NULL,
    priority INTEGER NOT NULL,
    attempt_no INTEGER NOT NULL,
    reason TEXT NOT NULL,
    failed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS leader_leases (
    name TEXT PRIMARY KEY,
    holder TEXT NOT NULL DEFAULT '',
    expires_at TEXT NOT NULL,
    fencing_token INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS schedule_state (
    name TEXT PRIMARY KEY,
    last_fire TEXT NOT NULL
);
"#;

fn json_string<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("serializing json column")
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: String, what: &str) -> Result<T> {
    serde_json::from_str(&raw).with_context(|| format!("parsing {what} column"))
}

fn row_to_product(row: &sqlx::sqlite::SqliteRow) -> Result<Product> {
    Ok(Product {
        source_id: row.get("source_id"),
        title: row.get("title"),
        subtitle: row.get("subtitle"),
        description: row.get("description"),
        price_min: row.get("price_min"),
        price_max: row.get("price_max"),
        currency: row.get("currency"),
        moq: row.get::<Option<i64>, _>("moq").map(|v| v as u32),
        price_unit: row.get("price_unit"),
        main_image_url: row.get("main_image_url"),
        detail_images: parse_json(row.get("detail_images"), "detail_images")?,
        specifications: parse_json(row.get("specifications"), "specifications")?,
        attributes: parse_json(row.get("attributes"), "attributes")?,
        supplier_source_id: row.get("supplier_source_id"),
        sales_count: row.get::<i64, _>("sales_count") as u32,
        review_count: row.get::<i64, _>("review_count") as u32,
        rating: row.get("rating"),
        category_id: row.get("category_id"),
        category_name: row.get("category_name"),
        status: ProductStatus::from_str(row.get("status")).map_err(anyhow::Error::msg)?,
        sync_status: SyncStatus::from_str(row.get("sync_status")).map_err(anyhow::Error::msg)?,
        last_sync_time: row.get("last_sync_time"),
        canonical_of: row.get("canonical_of"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    })
}

fn row_to_supplier(row: &sqlx::sqlite::SqliteRow) -> Result<Supplier> {
    let contact: ContactInfo = parse_json(row.get("contact"), "contact")?;
    Ok(Supplier {
        source_id: row.get("source_id"),
        name: row.get("name"),
        company_name: row.get("company_name"),
        contact,
        province: row.get("province"),
        city: row.get("city"),
        address: row.get("address"),
        rating: row.get("rating"),
        response_rate: row.get("response_rate"),
        product_count: row.get::<i64, _>("product_count") as u32,
        business_type: BusinessType::from_str(row.get("business_type")).map_err(anyhow::Error::msg)?,
        main_products: parse_json(row.get("main_products"), "main_products")?,
        certifications: parse_json(row.get("certifications"), "certifications")?,
        registered_capital: row.get("registered_capital"),
        established_date: row.get("established_date"),
        verified: row.get::<i64, _>("verified") != 0,
        verification_level: row.get("verification_level"),
        canonical_of: row.get("canonical_of"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    })
}

fn row_to_image(row: &sqlx::sqlite::SqliteRow) -> Result<ProductImage> {
    Ok(ProductImage {
        product_source_id: row.get("product_source_id"),
        url: row.get("url"),
        kind: ImageKind::from_str(row.get("kind")).map_err(anyhow::Error::msg)?,
        order_index: row.get::<i64, _>("order_index") as u32,
        alt_text: row.get("alt_text"),
        file_size: row.get::<Option<i64>, _>("file_size").map(|v| v as u64),
        width: row.get::<Option<i64>, _>("width").map(|v| v as u32),
        height: row.get::<Option<i64>, _>("height").map(|v| v as u32),
        status: ImageStatus::from_str(row.get("status")).map_err(anyhow::Error::msg)?,
        object_key: row.get("object_key"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> Result<SyncRun> {
    Ok(SyncRun {
        run_id: row.get("run_id"),
        task_id: row.get("task_id"),
        task_name: row.get("task_name"),
        operation_type: OperationType::from_str(row.get("operation_type")).map_err(anyhow::Error::msg)?,
        sync_type: SyncType::from_str(row.get("sync_type")).map_err(anyhow::Error::msg)?,
        status: SyncRunStatus::from_str(row.get("status")).map_err(anyhow::Error::msg)?,
        progress: row.get::<i64, _>("progress") as u8,
        counters: SyncCounters {
            total: row.get::<i64, _>("total") as u64,
            processed: row.get::<i64, _>("processed") as u64,
            success: row.get::<i64, _>("success") as u64,
            failed: row.get::<i64, _>("failed") as u64,
            skipped: row.get::<i64, _>("skipped") as u64,
        },
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        error_digest: parse_json(row.get("error_digest"), "error_digest")?,
        config_snapshot: parse_json(row.get("config_snapshot"), "config_snapshot")?,
        recommendations: parse_json(row.get("recommendations"), "recommendations")?,
        cancel_requested: row.get::<i64, _>("cancel_requested") != 0,
        retry_of: row.get("retry_of"),
        created_at: row.get("created_at"),
    })
}

fn row_to_work(row: &sqlx::sqlite::SqliteRow) -> Result<QueuedWork, QueueError> {
    let work_id: String = row.get("work_id");
    let work_id = WorkId::from_str(&work_id).map_err(|e| QueueError::Unavailable(e.to_string()))?;
    let priority = Priority::from_level(row.get::<i64, _>("priority"))
        .ok_or_else(|| QueueError::Unavailable("bad priority level".to_string()))?;
    let lease = match (
        row.get::<Option<String>, _>("lease_token"),
        row.get::<Option<String>, _>("lease_worker"),
        row.get::<Option<DateTime<Utc>>, _>("lease_deadline"),
    ) {
        (Some(token), Some(worker), Some(deadline)) => Some(WorkLease {
            token: Uuid::parse_str(&token).map_err(|e| QueueError::Unavailable(e.to_string()))?,
            worker_id: worker,
            deadline,
        }),
        _ => None,
    };

    Ok(QueuedWork {
        work_id,
        task_name: row.get("task_name"),
        args: serde_json::from_str(row.get("args"))?,
        queue: row.get("queue_name"),
        priority,
        attempt_no: row.get::<i64, _>("attempt_no") as u32,
        not_before: row.get("not_before"),
        enqueued_at: row.get("enqueued_at"),
        lease,
        last_error: row.get("last_error"),
    })
}

#[async_trait]
impl ProductRepository for SqliteStore {
    async fn upsert(&self, product: &Product) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT * FROM products WHERE source_id = ?")
            .bind(&product.source_id)
            .fetch_optional(&mut *tx)
            .await?;

        let outcome = match existing {
            Some(row) => {
                let current = row_to_product(&row)?;
                if current.canonical_snapshot() == product.canonical_snapshot() {
                    tx.commit().await?;
                    return Ok(UpsertOutcome::Unchanged);
                }
                sqlx::query(
                    r#"
                    UPDATE products SET
                        title = ?, subtitle = ?, description = ?, price_min = ?, price_max = ?,
                        currency = ?, moq = ?, price_unit = ?, main_image_url = ?, detail_images = ?,
                        specifications = ?, attributes = ?, supplier_source_id = ?, sales_count = ?,
                        review_count = ?, rating = ?, category_id = ?, category_name = ?, status = ?,
                        canonical_of = ?, updated_at = ?, deleted_at = ?
                    WHERE source_id = ?
                    "#,
                )
                .bind(&product.title)
                .bind(&product.subtitle)
                .bind(&product.description)
                .bind(product.price_min)
                .bind(product.price_max)
                .bind(&product.currency)
                .bind(product.moq.map(|v| v as i64))
                .bind(&product.price_unit)
                .bind(&product.main_image_url)
                .bind(json_string(&product.detail_images)?)
                .bind(json_string(&product.specifications)?)
                .bind(json_string(&product.attributes)?)
                .bind(&product.supplier_source_id)
                .bind(product.sales_count as i64)
                .bind(product.review_count as i64)
                .bind(product.rating)
                .bind(&product.category_id)
                .bind(&product.category_name)
                .bind(product.status.as_str())
                .bind(&product.canonical_of)
                .bind(Utc::now())
                .bind(product.deleted_at)
                .bind(&product.source_id)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Updated
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO products
                        (source_id, title, subtitle, description, price_min, price_max, currency,
                         moq, price_unit, main_image_url, detail_images, specifications, attributes,
                         supplier_source_id, sales_count, review_count, rating, category_id,
                         category_name, status, sync_status, last_sync_time, canonical_of,
                         created_at, updated_at, deleted_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&product.source_id)
                .bind(&product.title)
                .bind(&product.subtitle)
                .bind(&product.description)
                .bind(product.price_min)
                .bind(product.price_max)
                .bind(&product.currency)
                .bind(product.moq.map(|v| v as i64))
                .bind(&product.price_unit)
                .bind(&product.main_image_url)
                .bind(json_string(&product.detail_images)?)
                .bind(json_string(&product.specifications)?)
                .bind(json_string(&product.attributes)?)
                .bind(&product.supplier_source_id)
                .bind(product.sales_count as i64)
                .bind(product.review_count as i64)
                .bind(product.rating)
                .bind(&product.category_id)
                .bind(&product.category_name)
                .bind(product.status.as_str())
                .bind(product.sync_status.as_str())
                .bind(product.last_sync_time)
                .bind(&product.canonical_of)
                .bind(product.created_at)
                .bind(product.updated_at)
                .bind(product.deleted_at)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Created
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn find_by_source_id(&self, source_id: &str) -> Result<Option<Product>> {
        let row = sqlx::query("SELECT * FROM products WHERE source_id = ?")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_product(&r)).transpose()
    }

    async fn list(&self, filter: &ProductFilter) -> Result<Vec<Product>> {
        let mut sql = String::from("SELECT * FROM products WHERE 1=1");
        if !filter.include_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }
        if filter.text.is_some() {
            sql.push_str(" AND (title LIKE ? OR subtitle LIKE ? OR description LIKE ?)");
        }
        if filter.category_id.is_some() {
            sql.push_str(" AND category_id = ?");
        }
        if filter.supplier_source_id.is_some() {
            sql.push_str(" AND supplier_source_id = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.sync_status.is_some() {
            sql.push_str(" AND sync_status = ?");
        }
        if filter.price_min.is_some() {
            sql.push_str(" AND price_max >= ?");
        }
        if filter.price_max.is_some() {
            sql.push_str(" AND price_min <= ?");
        }
        if filter.rating_min.is_some() {
            sql.push_str(" AND rating >= ?");
        }
        sql.push_str(" ORDER BY source_id LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(text) = &filter.text {
            let pattern = format!("%{text}%");
            query = query.bind(pattern.clone()).bind(pattern.clone()).bind(pattern);
        }
        if let Some(v) = &filter.category_id {
            query = query.bind(v);
        }
        if let Some(v) = &filter.supplier_source_id {
            query = query.bind(v);
        }
        if let Some(v) = &filter.status {
            query = query.bind(v);
        }
        if let Some(v) = &filter.sync_status {
            query = query.bind(v);
        }
        if let Some(v) = filter.price_min {
            query = query.bind(v);
        }
        if let Some(v) = filter.price_max {
            query = query.bind(v);
        }
        if let Some(v) = filter.rating_min {
            query = query.bind(v);
        }
        let limit = if filter.limit <= 0 { i64::MAX } else { filter.limit };
        query = query.bind(limit).bind(filter.offset.max(0));

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_product).collect()
    }

    async fn count(&self, filter: &ProductFilter) -> Result<i64> {
        // Delegates to list for filter parity; fine at sqlite scale
        let unbounded = ProductFilter { limit: 0, offset: 0, ..filter.clone() };
        Ok(ProductRepository::list(self, &unbounded).await?.len() as i64)
    }

    async fn soft_delete(&self, source_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE products SET deleted_at = ?, updated_at = ? WHERE source_id = ? AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn restore(&self, source_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE products SET deleted_at = NULL, updated_at = ? WHERE source_id = ? AND deleted_at IS NOT NULL",
        )
        .bind(Utc::now())
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_sync_status(&self, source_id: &str, status: SyncStatus) -> Result<()> {
        sqlx::query("UPDATE products SET sync_status = ? WHERE source_id = ?")
            .bind(status.as_str())
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_last_sync(&self, source_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE products SET last_sync_time = ? WHERE source_id = ?")
            .bind(at)
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_canonical_of(&self, source_id: &str, master: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE products SET canonical_of = ?, updated_at = ? WHERE source_id = ?")
            .bind(master)
            .bind(Utc::now())
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SupplierRepository for SqliteStore {
    async fn upsert(&self, supplier: &Supplier) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query("SELECT * FROM suppliers WHERE source_id = ?")
            .bind(&supplier.source_id)
            .fetch_optional(&mut *tx)
            .await?;

        let outcome = match existing {
            Some(row) => {
                let current = row_to_supplier(&row)?;
                if current.canonical_snapshot() == supplier.canonical_snapshot() {
                    tx.commit().await?;
                    return Ok(UpsertOutcome::Unchanged);
                }
                sqlx::query(
                    r#"
                    UPDATE suppliers SET
                        name = ?, company_name = ?, contact = ?, province = ?, city = ?, address = ?,
                        rating = ?, response_rate = ?, business_type = ?, main_products = ?,
                        certifications = ?, registered_capital = ?, established_date = ?, verified = ?,
                        verification_level = ?, canonical_of = ?, updated_at = ?, deleted_at = ?
                    WHERE source_id = ?
                    "#,
                )
                .bind(&supplier.name)
                .bind(&supplier.company_name)
                .bind(json_string(&supplier.contact)?)
                .bind(&supplier.province)
                .bind(&supplier.city)
                .bind(&supplier.address)
                .bind(supplier.rating)
                .bind(supplier.response_rate)
                .bind(supplier.business_type.as_str())
                .bind(json_string(&supplier.main_products)?)
                .bind(json_string(&supplier.certifications)?)
                .bind(&supplier.registered_capital)
                .bind(&supplier.established_date)
                .bind(supplier.verified as i64)
                .bind(&supplier.verification_level)
                .bind(&supplier.canonical_of)
                .bind(Utc::now())
                .bind(supplier.deleted_at)
                .bind(&supplier.source_id)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Updated
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO suppliers
                        (source_id, name, company_name, contact, province, city, address, rating,
                         response_rate, product_count, business_type, main_products, certifications,
                         registered_capital, established_date, verified, verification_level,
                         canonical_of, created_at, updated_at, deleted_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&supplier.source_id)
                .bind(&supplier.name)
                .bind(&supplier.company_name)
                .bind(json_string(&supplier.contact)?)
                .bind(&supplier.province)
                .bind(&supplier.city)
                .bind(&supplier.address)
                .bind(supplier.rating)
                .bind(supplier.response_rate)
                .bind(supplier.business_type.as_str())
                .bind(json_string(&supplier.main_products)?)
                .bind(json_string(&supplier.certifications)?)
                .bind(&supplier.registered_capital)
                .bind(&supplier.established_date)
                .bind(supplier.verified as i64)
                .bind(&supplier.verification_level)
                .bind(&supplier.canonical_of)
                .bind(supplier.created_at)
                .bind(supplier.updated_at)
                .bind(supplier.deleted_at)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Created
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn find_by_source_id(&self, source_id: &str) -> Result<Option<Supplier>> {
        let row = sqlx::query("SELECT * FROM suppliers WHERE source_id = ?")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_supplier(&r)).transpose()
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Supplier>> {
        let limit = if limit <= 0 { i64::MAX } else { limit };
        let rows = sqlx::query("SELECT * FROM suppliers ORDER BY source_id LIMIT ? OFFSET ?")
            .bind(limit)
            .bind(offset.max(0))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_supplier).collect()
    }

    async fn soft_delete(&self, source_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE suppliers SET deleted_at = ?, updated_at = ? WHERE source_id = ? AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn restore(&self, source_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE suppliers SET deleted_at = NULL, updated_at = ? WHERE source_id = ? AND deleted_at IS NOT NULL",
        )
        .bind(Utc::now())
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn refresh_product_count(&self, source_id: &str) -> Result<u32> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM products WHERE supplier_source_id = ? AND deleted_at IS NULL",
        )
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.get("cnt");
        sqlx::query("UPDATE suppliers SET product_count = ? WHERE source_id = ?")
            .bind(count)
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(count as u32)
    }

    async fn set_canonical_of(&self, source_id: &str, master: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE suppliers SET canonical_of = ?, updated_at = ? WHERE source_id = ?")
            .bind(master)
            .bind(Utc::now())
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ImageRepository for SqliteStore {
    async fn replace_for_product(&self, product_source_id: &str, images: &[ProductImage]) -> Result<()> {
        let main_count = images.iter().filter(|i| i.kind == ImageKind::Main).count();
        if main_count > 1 {
            bail!("product {product_source_id} would have {main_count} main images");
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM product_images WHERE product_source_id = ?")
            .bind(product_source_id)
            .execute(&mut *tx)
            .await?;
        for image in images {
            sqlx::query(
                r#"
                INSERT INTO product_images
                    (product_source_id, url, kind, order_index, alt_text, file_size, width, height,
                     status, object_key, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&image.product_source_id)
            .bind(&image.url)
            .bind(image.kind.as_str())
            .bind(image.order_index as i64)
            .bind(&image.alt_text)
            .bind(image.file_size.map(|v| v as i64))
            .bind(image.width.map(|v| v as i64))
            .bind(image.height.map(|v| v as i64))
            .bind(image.status.as_str())
            .bind(&image.object_key)
            .bind(image.created_at)
            .bind(image.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_for_product(&self, product_source_id: &str) -> Result<Vec<ProductImage>> {
        let rows = sqlx::query(
            "SELECT * FROM product_images WHERE product_source_id = ? ORDER BY kind, order_index",
        )
        .bind(product_source_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_image).collect()
    }

    async fn update(&self, image: &ProductImage) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE product_images SET
                url = ?, alt_text = ?, file_size = ?, width = ?, height = ?, status = ?,
                object_key = ?, updated_at = ?
            WHERE product_source_id = ? AND kind = ? AND order_index = ?
            "#,
        )
        .bind(&image.url)
        .bind(&image.alt_text)
        .bind(image.file_size.map(|v| v as i64))
        .bind(image.width.map(|v| v as i64))
        .bind(image.height.map(|v| v as i64))
        .bind(image.status.as_str())
        .bind(&image.object_key)
        .bind(Utc::now())
        .bind(&image.product_source_id)
        .bind(image.kind.as_str())
        .bind(image.order_index as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!(
                "image ({}, {}, {}) not found",
                image.product_source_id,
                image.kind,
                image.order_index
            );
        }
        Ok(())
    }

    async fn orphaned_object_keys(&self, known_keys: &[String]) -> Result<Vec<String>> {
        let mut orphans = Vec::new();
        for key in known_keys {
            let row = sqlx::query("SELECT COUNT(*) AS cnt FROM product_images WHERE object_key = ?")
                .bind(key)
                .fetch_one(&self.pool)
                .await?;
            if row.get::<i64, _>("cnt") == 0 {
                orphans.push(key.clone());
            }
        }
        Ok(orphans)
    }
}

#[async_trait]
impl VersionRepository for SqliteStore {
    async fn append(&self, record: &VersionRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT COALESCE(MAX(version_no), 0) AS latest FROM version_records WHERE entity_type = ? AND entity_id = ?",
        )
        .bind(record.entity_type.as_str())
        .bind(&record.entity_id)
        .fetch_one(&mut *tx)
        .await?;
        let latest: i64 = row.get("latest");
        if record.version_no as i64 != latest + 1 {
            bail!(
                "version gap for {}:{} (expected {}, got {})",
                record.entity_type.as_str(),
                record.entity_id,
                latest + 1,
                record.version_no
            );
        }

        sqlx::query(
            r#"
            INSERT INTO version_records
                (entity_type, entity_id, version_no, change_kind, author, created_at, checksum, snapshot, diff)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.entity_type.as_str())
        .bind(&record.entity_id)
        .bind(record.version_no as i64)
        .bind(record.change_kind.as_str())
        .bind(&record.author)
        .bind(record.created_at)
        .bind(&record.checksum)
        .bind(json_string(&record.snapshot)?)
        .bind(json_string(&record.diff)?)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn latest(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<VersionRecord>> {
        let row = sqlx::query(
            "SELECT * FROM version_records WHERE entity_type = ? AND entity_id = ? ORDER BY version_no DESC LIMIT 1",
        )
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_version(&r)).transpose()
    }

    async fn history(&self, entity_type: EntityType, entity_id: &str, limit: i64) -> Result<Vec<VersionRecord>> {
        let limit = if limit <= 0 { i64::MAX } else { limit };
        let rows = sqlx::query(
            "SELECT * FROM version_records WHERE entity_type = ? AND entity_id = ? ORDER BY version_no DESC LIMIT ?",
        )
        .bind(entity_type.as_str())
        .bind(entity_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_version).collect()
    }

    async fn prune(&self, keep_count: u32, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM version_records
            WHERE created_at < ?
              AND version_no <= (
                  SELECT MAX(version_no) - ?
                  FROM version_records AS newer
                  WHERE newer.entity_type = version_records.entity_type
                    AND newer.entity_id = version_records.entity_id
              )
            "#,
        )
        .bind(older_than)
        .bind(keep_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_version(row: &sqlx::sqlite::SqliteRow) -> Result<VersionRecord> {
    Ok(VersionRecord {
        entity_type: EntityType::from_str(row.get("entity_type")).map_err(anyhow::Error::msg)?,
        entity_id: row.get("entity_id"),
        version_no: row.get::<i64, _>("version_no") as u32,
        change_kind: ChangeKind::from_str(row.get("change_kind")).map_err(anyhow::Error::msg)?,
        author: row.get("author"),
        created_at: row.get("created_at"),
        checksum: row.get("checksum"),
        snapshot: parse_json(row.get("snapshot"), "snapshot")?,
        diff: parse_json(row.get("diff"), "diff")?,
    })
}

#[async_trait]
impl SyncRunRepository for SqliteStore {
    async fn create(&self, run: &SyncRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs
                (run_id, task_id, task_name, operation_type, sync_type, status, progress,
                 total, processed, success, failed, skipped, started_at, finished_at,
                 error_digest, config_snapshot, recommendations, cancel_requested, retry_of, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.task_id)
        .bind(&run.task_name)
        .bind(run.operation_type.as_str())
        .bind(run.sync_type.as_str())
        .bind(run.status.as_str())
        .bind(run.progress as i64)
        .bind(run.counters.total as i64)
        .bind(run.counters.processed as i64)
        .bind(run.counters.success as i64)
        .bind(run.counters.failed as i64)
        .bind(run.counters.skipped as i64)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(json_string(&run.error_digest)?)
        .bind(json_string(&run.config_snapshot)?)
        .bind(json_string(&run.recommendations)?)
        .bind(run.cancel_requested as i64)
        .bind(&run.retry_of)
        .bind(run.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, run: &SyncRun) -> Result<()> {
        // cancel_requested only ever latches on; OR with the stored flag
        sqlx::query(
            r#"
            UPDATE sync_runs SET
                task_id = ?, status = ?, progress = ?, total = ?, processed = ?, success = ?,
                failed = ?, skipped = ?, started_at = ?, finished_at = ?, error_digest = ?,
                recommendations = ?, cancel_requested = (cancel_requested OR ?)
            WHERE run_id = ?
            "#,
        )
        .bind(&run.task_id)
        .bind(run.status.as_str())
        .bind(run.progress as i64)
        .bind(run.counters.total as i64)
        .bind(run.counters.processed as i64)
        .bind(run.counters.success as i64)
        .bind(run.counters.failed as i64)
        .bind(run.counters.skipped as i64)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(json_string(&run.error_digest)?)
        .bind(json_string(&run.recommendations)?)
        .bind(run.cancel_requested as i64)
        .bind(&run.run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, run_id: &str) -> Result<Option<SyncRun>> {
        let row = sqlx::query("SELECT * FROM sync_runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_run(&r)).transpose()
    }

    async fn find_by_task(&self, task_id: &str) -> Result<Option<SyncRun>> {
        let row = sqlx::query("SELECT * FROM sync_runs WHERE task_id = ? ORDER BY created_at DESC LIMIT 1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_run(&r)).transpose()
    }

    async fn list_active(&self) -> Result<Vec<SyncRun>> {
        let rows = sqlx::query("SELECT * FROM sync_runs WHERE status IN ('pending', 'running')")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_run).collect()
    }

    async fn request_cancel(&self, run_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sync_runs SET cancel_requested = 1 WHERE run_id = ? AND status IN ('pending', 'running')",
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_cancel_requested(&self, run_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT cancel_requested FROM sync_runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map_or(false, |r| r.get::<i64, _>("cancel_requested") != 0))
    }

    async fn set_status(&self, run_id: &str, status: SyncRunStatus) -> Result<()> {
        if let Some(mut run) = SyncRunRepository::find(self, run_id).await? {
            run.transition(status)?;
            SyncRunRepository::update(self, &run).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointRepository for SqliteStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT COALESCE(MAX(sequence_no), 0) AS latest FROM checkpoints WHERE task_id = ?",
        )
        .bind(&checkpoint.task_id)
        .fetch_one(&mut *tx)
        .await?;
        let latest: i64 = row.get("latest");
        if checkpoint.sequence_no as i64 != latest + 1 {
            bail!(
                "checkpoint sequence gap for {} (expected {}, got {})",
                checkpoint.task_id,
                latest + 1,
                checkpoint.sequence_no
            );
        }

        sqlx::query(
            "INSERT INTO checkpoints (task_id, sequence_no, created_at, cursor, counters, checksum) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint.task_id)
        .bind(checkpoint.sequence_no as i64)
        .bind(checkpoint.created_at)
        .bind(&checkpoint.cursor)
        .bind(json_string(&checkpoint.counters)?)
        .bind(&checkpoint.checksum)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load_latest(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT * FROM checkpoints WHERE task_id = ? ORDER BY sequence_no DESC LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(Checkpoint {
                task_id: r.get("task_id"),
                sequence_no: r.get::<i64, _>("sequence_no") as u32,
                created_at: r.get("created_at"),
                cursor: r.get::<Vec<u8>, _>("cursor"),
                counters: parse_json(r.get("counters"), "counters")?,
                checksum: r.get("checksum"),
            })
        })
        .transpose()
    }

    async fn delete_for_task(&self, task_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LeaderLeaseRepository for SqliteStore {
    async fn try_acquire(&self, name: &str, holder: &str, ttl_secs: i64) -> Result<Option<u64>> {
        let now = Utc::now();
        let expires = now + chrono::Duration::seconds(ttl_secs);
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT holder, expires_at, fencing_token FROM leader_leases WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;

        let token = match row {
            None => {
                sqlx::query(
                    "INSERT INTO leader_leases (name, holder, expires_at, fencing_token) VALUES (?, ?, ?, 1)",
                )
                .bind(name)
                .bind(holder)
                .bind(expires)
                .execute(&mut *tx)
                .await?;
                Some(1)
            }
            Some(row) => {
                let current_holder: String = row.get("holder");
                let expires_at: DateTime<Utc> = row.get("expires_at");
                let fencing: i64 = row.get("fencing_token");

                if current_holder.is_empty() || current_holder == holder || expires_at <= now {
                    let next_token = if current_holder == holder { fencing } else { fencing + 1 };
                    sqlx::query(
                        "UPDATE leader_leases SET holder = ?, expires_at = ?, fencing_token = ? WHERE name = ?",
                    )
                    .bind(holder)
                    .bind(expires)
                    .bind(next_token)
                    .bind(name)
                    .execute(&mut *tx)
                    .await?;
                    Some(next_token as u64)
                } else {
                    None
                }
            }
        };

        tx.commit().await?;
        Ok(token)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<()> {
        sqlx::query("UPDATE leader_leases SET holder = '', expires_at = ? WHERE name = ? AND holder = ?")
            .bind(Utc::now())
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn current_holder(&self, name: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT holder, expires_at FROM leader_leases WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| {
            let holder: String = r.get("holder");
            let expires_at: DateTime<Utc> = r.get("expires_at");
            (!holder.is_empty() && expires_at > Utc::now()).then_some(holder)
        }))
    }
}

#[async_trait]
impl ScheduleStateRepository for SqliteStore {
    async fn last_fire(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_fire FROM schedule_state WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("last_fire")))
    }

    async fn record_fire(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO schedule_state (name, last_fire) VALUES (?, ?) ON CONFLICT(name) DO UPDATE SET last_fire = excluded.last_fire",
        )
        .bind(name)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn queue_err(error: sqlx::Error) -> QueueError {
    QueueError::Unavailable(error.to_string())
}

#[async_trait]
impl WorkQueue for SqliteStore {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<WorkId, QueueError> {
        let work_id = WorkId::new();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO queue_work (work_id, task_name, args, queue_name, priority, attempt_no, not_before, enqueued_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(work_id.to_string())
        .bind(&request.task_name)
        .bind(serde_json::to_string(&request.args)?)
        .bind(&request.queue)
        .bind(request.priority.level())
        .bind(request.not_before.unwrap_or(now))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;
        Ok(work_id)
    }

    async fn lease(
        &self,
        queues: &[String],
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<LeasedWork>, QueueError> {
        if queues.is_empty() {
            return Ok(None);
        }
        let now = Utc::now();
        let deadline = now
            + chrono::Duration::from_std(lease_ttl).map_err(|e| QueueError::Unavailable(e.to_string()))?;
        let token = Uuid::new_v4();

        let placeholders = vec!["?"; queues.len()].join(", ");
        let select_sql = format!(
            r#"
            SELECT * FROM queue_work
            WHERE queue_name IN ({placeholders})
              AND not_before <= ?
              AND (lease_deadline IS NULL OR lease_deadline <= ?)
            ORDER BY priority DESC, not_before ASC, id ASC
            LIMIT 1
            "#
        );

        let mut tx = self.pool.begin().await.map_err(queue_err)?;
        let mut query = sqlx::query(&select_sql);
        for queue in queues {
            query = query.bind(queue);
        }
        let row = query.bind(now).bind(now).fetch_optional(&mut *tx).await.map_err(queue_err)?;

        let Some(row) = row else {
            tx.commit().await.map_err(queue_err)?;
            return Ok(None);
        };
        let mut work = row_to_work(&row)?;

        let updated = sqlx::query(
            r#"
            UPDATE queue_work SET lease_token = ?, lease_worker = ?, lease_deadline = ?
            WHERE work_id = ? AND (lease_deadline IS NULL OR lease_deadline <= ?)
            "#,
        )
        .bind(token.to_string())
        .bind(worker_id)
        .bind(deadline)
        .bind(work.work_id.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(queue_err)?;
        tx.commit().await.map_err(queue_err)?;

        if updated.rows_affected() == 0 {
            // Raced with another worker; caller polls again
            return Ok(None);
        }

        work.lease = Some(WorkLease {
            token,
            worker_id: worker_id.to_string(),
            deadline,
        });
        Ok(Some(LeasedWork {
            work,
            lease_token: token,
            lease_deadline: deadline,
        }))
    }

    async fn extend(&self, work_id: WorkId, lease_token: Uuid, lease_ttl: Duration) -> Result<(), QueueError> {
        let now = Utc::now();
        let deadline = now
            + chrono::Duration::from_std(lease_ttl).map_err(|e| QueueError::Unavailable(e.to_string()))?;
        let result = sqlx::query(
            "UPDATE queue_work SET lease_deadline = ? WHERE work_id = ? AND lease_token = ? AND lease_deadline > ?",
        )
        .bind(deadline)
        .bind(work_id.to_string())
        .bind(lease_token.to_string())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;

        if result.rows_affected() == 0 {
            return Err(QueueError::StaleLease { work_id });
        }
        Ok(())
    }

    async fn ack(&self, work_id: WorkId, lease_token: Uuid) -> Result<(), QueueError> {
        let result = sqlx::query(
            "DELETE FROM queue_work WHERE work_id = ? AND lease_token = ? AND lease_deadline > ?",
        )
        .bind(work_id.to_string())
        .bind(lease_token.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;

        if result.rows_affected() == 0 {
            return Err(QueueError::StaleLease { work_id });
        }
        Ok(())
    }

    async fn nack(
        &self,
        work_id: WorkId,
        lease_token: Uuid,
        reason: &str,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let now = Utc::now();
        let not_before = now
            + chrono::Duration::from_std(delay).map_err(|e| QueueError::Unavailable(e.to_string()))?;
        let result = sqlx::query(
            r#"
            UPDATE queue_work SET
                lease_token = NULL, lease_worker = NULL, lease_deadline = NULL,
                attempt_no = attempt_no + 1, last_error = ?, not_before = ?
            WHERE work_id = ? AND lease_token = ? AND lease_deadline > ?
            "#,
        )
        .bind(reason)
        .bind(not_before)
        .bind(work_id.to_string())
        .bind(lease_token.to_string())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;

        if result.rows_affected() == 0 {
            return Err(QueueError::StaleLease { work_id });
        }
        Ok(())
    }

    async fn fail(&self, work_id: WorkId, lease_token: Uuid, reason: &str) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await.map_err(queue_err)?;
        let row = sqlx::query("SELECT * FROM queue_work WHERE work_id = ? AND lease_token = ? AND lease_deadline > ?")
            .bind(work_id.to_string())
            .bind(lease_token.to_string())
            .bind(Utc::now())
            .fetch_optional(&mut *tx)
            .await
            .map_err(queue_err)?;

        let Some(row) = row else {
            return Err(QueueError::StaleLease { work_id });
        };
        let work = row_to_work(&row)?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO queue_dead_letter
                (work_id, task_name, args, queue_name, priority, attempt_no, reason, failed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(work.work_id.to_string())
        .bind(&work.task_name)
        .bind(serde_json::to_string(&work.args)?)
        .bind(&work.queue)
        .bind(work.priority.level())
        .bind(work.attempt_no as i64)
        .bind(reason)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(queue_err)?;

        sqlx::query("DELETE FROM queue_work WHERE work_id = ?")
            .bind(work.work_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(queue_err)?;
        tx.commit().await.map_err(queue_err)?;
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS cnt FROM queue_work
            WHERE queue_name = ? AND not_before <= ? AND (lease_deadline IS NULL OR lease_deadline <= ?)
            "#,
        )
        .bind(queue)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(queue_err)?;
        Ok(row.get::<i64, _>("cnt") as u64)
    }

    async fn depths(&self) -> Result<Vec<QueueDepth>, QueueError> {
        let now = Utc::now();
        let rows = sqlx::query(
            r#"
            SELECT queue_name, priority,
                   SUM(CASE WHEN not_before <= ?1 AND (lease_deadline IS NULL OR lease_deadline <= ?1) THEN 1 ELSE 0 END) AS ready,
                   SUM(CASE WHEN lease_deadline IS NOT NULL AND lease_deadline > ?1 THEN 1 ELSE 0 END) AS leased
            FROM queue_work
            GROUP BY queue_name, priority
            ORDER BY queue_name, priority DESC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(queue_err)?;

        let mut depths = Vec::new();
        for row in rows {
            let Some(priority) = Priority::from_level(row.get::<i64, _>("priority")) else {
                continue;
            };
            depths.push(QueueDepth {
                queue: row.get("queue_name"),
                priority,
                ready: row.get::<i64, _>("ready") as u64,
                leased: row.get::<i64, _>("leased") as u64,
            });
        }
        Ok(depths)
    }

    async fn find(&self, work_id: WorkId) -> Result<Option<QueuedWork>, QueueError> {
        let row = sqlx::query("SELECT * FROM queue_work WHERE work_id = ?")
            .bind(work_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(queue_err)?;
        row.map(|r| row_to_work(&r)).transpose()
    }
}
