//! Canonical marketplace entities
//!
//! Suppliers, products and product images in their cleaned, validated form.
//! Entities are keyed by the marketplace `source_id`; the numeric row id of
//! the backing store never leaves the persistence layer.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Supplier classification on the source marketplace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessType {
    Manufacturer,
    Trader,
    Individual,
}

impl BusinessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manufacturer => "manufacturer",
            Self::Trader => "trader",
            Self::Individual => "individual",
        }
    }

    /// Map a raw marketplace label onto the canonical set. Unknown labels
    /// fall back to `Trader`, the most common kind on the source site.
    pub fn from_source_label(label: &str) -> Self {
        let label = label.trim().to_lowercase();
        match label.as_str() {
            "manufacturer" | "factory" | "生产厂家" | "生产加工" => Self::Manufacturer,
            "individual" | "个体经营" => Self::Individual,
            _ => Self::Trader,
        }
    }
}

impl FromStr for BusinessType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manufacturer" => Ok(Self::Manufacturer),
            "trader" => Ok(Self::Trader),
            "individual" => Ok(Self::Individual),
            other => Err(format!("unknown business type: {other}")),
        }
    }
}

/// Lifecycle status of a product on the source site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Active,
    Inactive,
    Discontinued,
}

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Discontinued => "discontinued",
        }
    }

    /// Import mapping for externally authored status labels. Unknown labels
    /// become `Inactive`; the importer records a diagnostic for them.
    pub fn from_source_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "active" | "online" | "onsale" | "在售" => Self::Active,
            "discontinued" | "deleted" | "下架" => Self::Discontinued,
            _ => Self::Inactive,
        }
    }
}

impl FromStr for ProductStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "discontinued" => Ok(Self::Discontinued),
            other => Err(format!("unknown product status: {other}")),
        }
    }
}

/// Synchronization state of an entity relative to the source site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown sync status: {other}")),
        }
    }
}

/// Role of an image within a product listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Main,
    Detail,
    Thumbnail,
}

impl ImageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Detail => "detail",
            Self::Thumbnail => "thumbnail",
        }
    }
}

impl FromStr for ImageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(Self::Main),
            "detail" => Ok(Self::Detail),
            "thumbnail" => Ok(Self::Thumbnail),
            other => Err(format!("unknown image kind: {other}")),
        }
    }
}

/// Download state of an image object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ImageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown image status: {other}")),
        }
    }
}

/// Contact channels for a supplier, cleaned to canonical form
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub phone: Option<String>,
    pub email: Option<String>,
    pub qq: Option<String>,
    pub wechat: Option<String>,
}

impl ContactInfo {
    pub fn is_empty(&self) -> bool {
        self.phone.is_none() && self.email.is_none() && self.qq.is_none() && self.wechat.is_none()
    }
}

/// Canonical supplier record
///
/// `source_id` is immutable and unique among non-deleted rows.
/// `product_count` is derived from the product table, never authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Supplier {
    pub source_id: String,
    pub name: String,
    pub company_name: Option<String>,
    pub contact: ContactInfo,
    pub province: Option<String>,
    pub city: Option<String>,
    pub address: Option<String>,
    pub rating: Option<f64>,
    pub response_rate: Option<f64>,
    pub product_count: u32,
    pub business_type: BusinessType,
    pub main_products: Vec<String>,
    pub certifications: Vec<String>,
    pub registered_capital: Option<String>,
    pub established_date: Option<String>,
    pub verified: bool,
    pub verification_level: Option<String>,
    /// Back-pointer to the dedup master, if this record is a duplicate
    pub canonical_of: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Supplier {
    pub fn new(source_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            source_id: source_id.into(),
            name: name.into(),
            company_name: None,
            contact: ContactInfo::default(),
            province: None,
            city: None,
            address: None,
            rating: None,
            response_rate: None,
            product_count: 0,
            business_type: BusinessType::Trader,
            main_products: Vec::new(),
            certifications: Vec::new(),
            registered_capital: None,
            established_date: None,
            verified: false,
            verification_level: None,
            canonical_of: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Snapshot used for version checksums. Volatile bookkeeping fields
    /// (timestamps, derived counters) are excluded so that re-extracting an
    /// unchanged supplier produces identical canonical bytes.
    pub fn canonical_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "source_id": self.source_id,
            "name": self.name,
            "company_name": self.company_name,
            "contact": self.contact,
            "province": self.province,
            "city": self.city,
            "address": self.address,
            "rating": self.rating,
            "response_rate": self.response_rate,
            "business_type": self.business_type,
            "main_products": self.main_products,
            "certifications": self.certifications,
            "registered_capital": self.registered_capital,
            "established_date": self.established_date,
            "verified": self.verified,
            "verification_level": self.verification_level,
            "canonical_of": self.canonical_of,
            "deleted": self.deleted_at.is_some(),
        })
    }
}

/// Canonical product record
///
/// Invariants: `price_min <= price_max` when both are present;
/// `supplier_source_id` resolves to an existing, non-deleted supplier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub source_id: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub description: Option<String>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub currency: String,
    pub moq: Option<u32>,
    pub price_unit: Option<String>,
    pub main_image_url: Option<String>,
    /// Ordered detail image URLs as shown on the source page
    pub detail_images: Vec<String>,
    pub specifications: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
    pub supplier_source_id: Option<String>,
    pub sales_count: u32,
    pub review_count: u32,
    pub rating: Option<f64>,
    pub category_id: Option<String>,
    pub category_name: Option<String>,
    pub status: ProductStatus,
    pub sync_status: SyncStatus,
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Back-pointer to the dedup master, if this record is a duplicate
    pub canonical_of: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Product {
    pub fn new(source_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            source_id: source_id.into(),
            title: title.into(),
            subtitle: None,
            description: None,
            price_min: None,
            price_max: None,
            currency: "CNY".to_string(),
            moq: None,
            price_unit: None,
            main_image_url: None,
            detail_images: Vec::new(),
            specifications: BTreeMap::new(),
            attributes: BTreeMap::new(),
            supplier_source_id: None,
            sales_count: 0,
            review_count: 0,
            rating: None,
            category_id: None,
            category_name: None,
            status: ProductStatus::Active,
            sync_status: SyncStatus::Pending,
            last_sync_time: None,
            canonical_of: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Snapshot used for version checksums; excludes sync bookkeeping and
    /// timestamps so that an unchanged listing produces identical bytes.
    pub fn canonical_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "source_id": self.source_id,
            "title": self.title,
            "subtitle": self.subtitle,
            "description": self.description,
            "price_min": self.price_min,
            "price_max": self.price_max,
            "currency": self.currency,
            "moq": self.moq,
            "price_unit": self.price_unit,
            "main_image_url": self.main_image_url,
            "detail_images": self.detail_images,
            "specifications": self.specifications,
            "attributes": self.attributes,
            "supplier_source_id": self.supplier_source_id,
            "sales_count": self.sales_count,
            "review_count": self.review_count,
            "rating": self.rating,
            "category_id": self.category_id,
            "category_name": self.category_name,
            "status": self.status,
            "canonical_of": self.canonical_of,
            "deleted": self.deleted_at.is_some(),
        })
    }
}

/// A single image belonging to a product
///
/// Exactly one `Main` image per product; `order_index` is unique within
/// `(product, kind)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductImage {
    pub product_source_id: String,
    pub url: String,
    pub kind: ImageKind,
    pub order_index: u32,
    pub alt_text: Option<String>,
    pub file_size: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub status: ImageStatus,
    /// Content-addressed key in the image store, set once downloaded
    pub object_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProductImage {
    pub fn new(product_source_id: impl Into<String>, url: impl Into<String>, kind: ImageKind, order_index: u32) -> Self {
        let now = Utc::now();
        Self {
            product_source_id: product_source_id.into(),
            url: url.into(),
            kind,
            order_index,
            alt_text: None,
            file_size: None,
            width: None,
            height: None,
            status: ImageStatus::Pending,
            object_key: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_type_source_labels() {
        assert_eq!(BusinessType::from_source_label("生产厂家"), BusinessType::Manufacturer);
        assert_eq!(BusinessType::from_source_label("Factory"), BusinessType::Manufacturer);
        assert_eq!(BusinessType::from_source_label("经销批发"), BusinessType::Trader);
    }

    #[test]
    fn product_status_roundtrip() {
        for status in [ProductStatus::Active, ProductStatus::Inactive, ProductStatus::Discontinued] {
            assert_eq!(status.as_str().parse::<ProductStatus>().unwrap(), status);
        }
    }

    #[test]
    fn canonical_snapshot_ignores_sync_bookkeeping() {
        let mut product = Product::new("p-1", "widget");
        let before = product.canonical_snapshot();

        product.sync_status = SyncStatus::Completed;
        product.last_sync_time = Some(Utc::now());
        product.updated_at = Utc::now();

        assert_eq!(before, product.canonical_snapshot());
    }
}
