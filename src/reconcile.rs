//! Idempotent upsert of normalized records. Parcels commit first; products
//! link against committed parcels and orphans are skipped, never fatal.

use crate::enrich::{EnrichmentTask, needs_enrichment};
use crate::models::{
    EnrichmentRecord, EnrichmentState, NormalizedParcel, NormalizedProduct, ParcelRow, ProductRow,
    price_per_unit,
};
use crate::status::canonical_status;
use crate::store::{StoreError, SyncStore};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Default, Clone, Copy)]
pub struct ParcelTally {
    pub inserted: usize,
    pub updated: usize,
}

impl ParcelTally {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Debug, Default)]
pub struct ProductTally {
    pub inserted: usize,
    pub updated: usize,
    pub skipped_orphans: usize,
    pub enrichment_queue: Vec<EnrichmentTask>,
}

impl ProductTally {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Phase one: parcels. Must complete before any product upsert so product
/// linkage always resolves against committed rows.
pub async fn upsert_parcels(
    store: &dyn SyncStore,
    owner_id: &str,
    parcels: &[NormalizedParcel],
) -> Result<ParcelTally, StoreError> {
    let mut tally = ParcelTally::default();
    let now = Utc::now();

    for parcel in parcels {
        let status = canonical_status(&parcel.status_raw);
        match store.find_parcel(owner_id, &parcel.external_id).await? {
            Some(mut existing) => {
                existing.tracking_number = parcel
                    .tracking_number
                    .clone()
                    .or(existing.tracking_number);
                existing.carrier = parcel.carrier.clone();
                existing.weight = parcel.weight;
                existing.status = status;
                existing.total_price = parcel.total_price;
                existing.price_per_unit = price_per_unit(parcel.total_price, parcel.weight);
                existing.updated_at = now;
                store.update_parcel(existing).await?;
                tally.updated += 1;
            }
            None => {
                store
                    .insert_parcel(ParcelRow {
                        id: Uuid::new_v4(),
                        owner_id: owner_id.to_string(),
                        external_id: parcel.external_id.clone(),
                        tracking_number: parcel.tracking_number.clone(),
                        carrier: parcel.carrier.clone(),
                        weight: parcel.weight,
                        status,
                        total_price: parcel.total_price,
                        price_per_unit: price_per_unit(parcel.total_price, parcel.weight),
                        active: true,
                        created_at: now,
                        updated_at: now,
                    })
                    .await?;
                tally.inserted += 1;
            }
        }
    }

    Ok(tally)
}

/// Phase two: products. Each product resolves its parcel by external id for
/// the same owner; a missing parcel skips the record and the batch carries
/// on.
pub async fn upsert_products(
    store: &dyn SyncStore,
    owner_id: &str,
    products: &[NormalizedProduct],
) -> Result<ProductTally, StoreError> {
    let mut tally = ProductTally::default();
    let now = Utc::now();

    for product in products {
        let Some(parcel) = store
            .find_parcel(owner_id, &product.parcel_external_id)
            .await?
        else {
            warn!(
                target = "parcelsync.reconcile",
                owner_id,
                product = %product.external_id,
                parcel = %product.parcel_external_id,
                "orphan product skipped, parcel not persisted"
            );
            tally.skipped_orphans += 1;
            continue;
        };

        let status = canonical_status(&product.status_raw);
        let row = match store.find_product(owner_id, &product.external_id).await? {
            Some(mut existing) => {
                // conflicts never overwrote these fields, so only a finished
                // enrichment protects them from upstream refresh
                let keep_enriched = existing.enrichment.state == EnrichmentState::Done;
                if !keep_enriched {
                    existing.name = product.name.clone();
                    existing.brand = product.brand.clone();
                    existing.category = product.category.clone();
                }
                existing.photo_urls = product.photo_urls.clone();
                existing.price = product.price;
                existing.weight = product.weight;
                existing.parcel_id = parcel.id;
                existing.status = status;
                existing.updated_at = now;
                if needs_enrichment(&existing.enrichment) {
                    existing.enrichment.state = EnrichmentState::Pending;
                    existing.enrichment.updated_at = Some(now);
                }
                store.update_product(existing.clone()).await?;
                tally.updated += 1;
                existing
            }
            None => {
                let row = ProductRow {
                    id: Uuid::new_v4(),
                    owner_id: owner_id.to_string(),
                    external_id: product.external_id.clone(),
                    name: product.name.clone(),
                    brand: product.brand.clone(),
                    category: product.category.clone(),
                    subcategory: None,
                    url: None,
                    description: None,
                    photo_urls: product.photo_urls.clone(),
                    price: product.price,
                    weight: product.weight,
                    parcel_id: parcel.id,
                    status,
                    enrichment: EnrichmentRecord {
                        state: EnrichmentState::Pending,
                        updated_at: Some(now),
                        ..EnrichmentRecord::default()
                    },
                    created_at: now,
                    updated_at: now,
                };
                store.insert_product(row.clone()).await?;
                tally.inserted += 1;
                row
            }
        };

        if row.enrichment.state == EnrichmentState::Pending
            && !tally
                .enrichment_queue
                .iter()
                .any(|task| task.product_id == row.id)
        {
            tally.enrichment_queue.push(EnrichmentTask {
                product_id: row.id,
                owner_id: owner_id.to_string(),
                name: row.name.clone(),
                images: row.photo_urls.clone(),
                metadata: Some(json!({
                    "external_id": row.external_id,
                    "category": row.category,
                    "brand": row.brand,
                })),
            });
        }
    }

    debug!(
        target = "parcelsync.reconcile",
        owner_id,
        inserted = tally.inserted,
        updated = tally.updated,
        skipped = tally.skipped_orphans,
        queued = tally.enrichment_queue.len(),
        "product upsert finished"
    );
    Ok(tally)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CanonicalStatus, PriceSource};
    use crate::store::MemoryStore;

    fn sample_parcel(external_id: &str) -> NormalizedParcel {
        NormalizedParcel {
            external_id: external_id.into(),
            tracking_number: Some("TRK1".into()),
            carrier: "DHL".into(),
            weight: 500.0,
            status_raw: "shipped".into(),
            total_price: 11.25,
            price_source: PriceSource::Package,
        }
    }

    fn sample_product(external_id: &str, parcel: &str) -> NormalizedProduct {
        NormalizedProduct {
            external_id: external_id.into(),
            name: "Widget".into(),
            brand: None,
            category: None,
            photo_urls: vec!["http://img/1.jpg".into()],
            price: 32.3,
            price_source: PriceSource::Listed,
            weight: 100.0,
            parcel_external_id: parcel.into(),
            status_raw: "shipped".into(),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = MemoryStore::new();
        let parcels = vec![sample_parcel("PN1")];
        let products = vec![sample_product("B1", "PN1")];

        upsert_parcels(&store, "o1", &parcels).await.unwrap();
        upsert_products(&store, "o1", &products).await.unwrap();
        let first = store.find_parcel("o1", "PN1").await.unwrap().unwrap();

        upsert_parcels(&store, "o1", &parcels).await.unwrap();
        upsert_products(&store, "o1", &products).await.unwrap();
        let second = store.find_parcel("o1", "PN1").await.unwrap().unwrap();

        assert_eq!(store.parcel_count(), 1);
        assert_eq!(store.product_count(), 1);
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(first.total_price, second.total_price);
        assert_eq!(first.status, second.status);
    }

    #[tokio::test]
    async fn parcel_fields_map_and_derive() {
        let store = MemoryStore::new();
        upsert_parcels(&store, "o1", &[sample_parcel("PN1")])
            .await
            .unwrap();
        let row = store.find_parcel("o1", "PN1").await.unwrap().unwrap();
        assert_eq!(row.status, CanonicalStatus::InTransit);
        assert!((row.price_per_unit - 11.25 / 500.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn zero_weight_parcel_gets_zero_price_per_unit() {
        let store = MemoryStore::new();
        let mut parcel = sample_parcel("PN1");
        parcel.weight = 0.0;
        upsert_parcels(&store, "o1", &[parcel]).await.unwrap();
        let row = store.find_parcel("o1", "PN1").await.unwrap().unwrap();
        assert_eq!(row.price_per_unit, 0.0);
    }

    #[tokio::test]
    async fn orphan_product_is_skipped_without_failing_the_batch() {
        let store = MemoryStore::new();
        upsert_parcels(&store, "o1", &[sample_parcel("PN1")])
            .await
            .unwrap();
        let products = vec![
            sample_product("B1", "PN1"),
            sample_product("B2", "MISSING"),
            sample_product("B3", "PN1"),
        ];
        let tally = upsert_products(&store, "o1", &products).await.unwrap();
        assert_eq!(tally.inserted, 2);
        assert_eq!(tally.skipped_orphans, 1);
        assert!(store.find_product("o1", "B2").await.unwrap().is_none());
        assert!(store.find_product("o1", "B3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn done_enrichment_survives_resync() {
        let store = MemoryStore::new();
        upsert_parcels(&store, "o1", &[sample_parcel("PN1")])
            .await
            .unwrap();
        upsert_products(&store, "o1", &[sample_product("B1", "PN1")])
            .await
            .unwrap();

        let mut row = store.find_product("o1", "B1").await.unwrap().unwrap();
        row.name = "Enriched Widget".into();
        row.brand = Some("Acme".into());
        row.enrichment.state = EnrichmentState::Done;
        store.update_product(row).await.unwrap();

        let tally = upsert_products(&store, "o1", &[sample_product("B1", "PN1")])
            .await
            .unwrap();
        let row = store.find_product("o1", "B1").await.unwrap().unwrap();
        assert_eq!(row.name, "Enriched Widget");
        assert_eq!(row.brand.as_deref(), Some("Acme"));
        assert_eq!(row.enrichment.state, EnrichmentState::Done);
        assert!(tally.enrichment_queue.is_empty());
    }

    #[tokio::test]
    async fn conflicted_product_still_takes_upstream_field_refresh() {
        let store = MemoryStore::new();
        upsert_parcels(&store, "o1", &[sample_parcel("PN1")])
            .await
            .unwrap();
        upsert_products(&store, "o1", &[sample_product("B1", "PN1")])
            .await
            .unwrap();

        let mut row = store.find_product("o1", "B1").await.unwrap().unwrap();
        row.enrichment.state = EnrichmentState::Conflict;
        row.enrichment.candidates = vec![crate::models::EnrichmentCandidate {
            provisional_id: "c1".into(),
            confidence: 0.4,
            name: Some("Maybe Widget".into()),
            brand: None,
            category: None,
        }];
        store.update_product(row).await.unwrap();

        let mut renamed = sample_product("B1", "PN1");
        renamed.name = "Widget v2".into();
        renamed.brand = Some("Acme".into());
        let tally = upsert_products(&store, "o1", &[renamed]).await.unwrap();

        let row = store.find_product("o1", "B1").await.unwrap().unwrap();
        assert_eq!(row.name, "Widget v2");
        assert_eq!(row.brand.as_deref(), Some("Acme"));
        // the conflict itself stays parked for manual resolution
        assert_eq!(row.enrichment.state, EnrichmentState::Conflict);
        assert_eq!(row.enrichment.candidates.len(), 1);
        assert!(tally.enrichment_queue.is_empty());
    }

    #[tokio::test]
    async fn failed_enrichment_requeues_on_sync() {
        let store = MemoryStore::new();
        upsert_parcels(&store, "o1", &[sample_parcel("PN1")])
            .await
            .unwrap();
        upsert_products(&store, "o1", &[sample_product("B1", "PN1")])
            .await
            .unwrap();

        let mut row = store.find_product("o1", "B1").await.unwrap().unwrap();
        row.enrichment.state = EnrichmentState::Failed;
        row.enrichment.error = Some("timeout".into());
        store.update_product(row).await.unwrap();

        let tally = upsert_products(&store, "o1", &[sample_product("B1", "PN1")])
            .await
            .unwrap();
        assert_eq!(tally.enrichment_queue.len(), 1);
        let row = store.find_product("o1", "B1").await.unwrap().unwrap();
        assert_eq!(row.enrichment.state, EnrichmentState::Pending);
    }

    #[tokio::test]
    async fn duplicated_lines_collapse_to_one_row_and_one_task() {
        let store = MemoryStore::new();
        upsert_parcels(&store, "o1", &[sample_parcel("PN1")])
            .await
            .unwrap();
        let duplicated = vec![
            sample_product("B1", "PN1"),
            sample_product("B1", "PN1"),
            sample_product("B1", "PN1"),
        ];
        let tally = upsert_products(&store, "o1", &duplicated).await.unwrap();
        assert_eq!(store.product_count(), 1);
        assert_eq!(tally.enrichment_queue.len(), 1);
    }
}
