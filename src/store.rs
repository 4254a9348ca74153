//! Storage collaborators. The relational engine itself is out of scope;
//! these traits describe the row-level operations the pipeline needs, keyed
//! by `(owner_id, external_id)`. `MemoryStore` backs tests and offline runs,
//! the PostgREST client in `supabase.rs` backs hosted deployments.

use crate::models::{CredentialRecord, ParcelRow, ProductRow};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn find_parcel(
        &self,
        owner_id: &str,
        external_id: &str,
    ) -> Result<Option<ParcelRow>, StoreError>;
    async fn insert_parcel(&self, row: ParcelRow) -> Result<(), StoreError>;
    async fn update_parcel(&self, row: ParcelRow) -> Result<(), StoreError>;

    async fn find_product(
        &self,
        owner_id: &str,
        external_id: &str,
    ) -> Result<Option<ProductRow>, StoreError>;
    async fn find_product_by_id(&self, id: Uuid) -> Result<Option<ProductRow>, StoreError>;
    async fn insert_product(&self, row: ProductRow) -> Result<(), StoreError>;
    async fn update_product(&self, row: ProductRow) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, owner_id: &str) -> Result<Option<CredentialRecord>, StoreError>;
    async fn put(&self, record: CredentialRecord) -> Result<(), StoreError>;
}

/// Opaque encrypt/decrypt capability for secrets at rest. Real deployments
/// plug in the platform cipher; the pipeline never looks inside.
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plain: &str) -> String;
    fn decrypt(&self, ciphertext: &str) -> Option<String>;
}

/// Carrier encoding for environments where the cipher collaborator is not
/// wired up. Not encryption.
pub struct Base64Cipher;

impl SecretCipher for Base64Cipher {
    fn encrypt(&self, plain: &str) -> String {
        BASE64.encode(plain)
    }

    fn decrypt(&self, ciphertext: &str) -> Option<String> {
        let bytes = BASE64.decode(ciphertext).ok()?;
        String::from_utf8(bytes).ok()
    }
}

#[derive(Default)]
struct MemoryState {
    parcels: HashMap<(String, String), ParcelRow>,
    products: HashMap<(String, String), ProductRow>,
    credentials: HashMap<String, CredentialRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parcel_count(&self) -> usize {
        self.state.lock().expect("store poisoned").parcels.len()
    }

    pub fn product_count(&self) -> usize {
        self.state.lock().expect("store poisoned").products.len()
    }

    pub fn remove_product(&self, id: Uuid) {
        let mut state = self.state.lock().expect("store poisoned");
        state.products.retain(|_, row| row.id != id);
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn find_parcel(
        &self,
        owner_id: &str,
        external_id: &str,
    ) -> Result<Option<ParcelRow>, StoreError> {
        let state = self.state.lock().expect("store poisoned");
        Ok(state
            .parcels
            .get(&(owner_id.to_string(), external_id.to_string()))
            .cloned())
    }

    async fn insert_parcel(&self, row: ParcelRow) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("store poisoned");
        state
            .parcels
            .insert((row.owner_id.clone(), row.external_id.clone()), row);
        Ok(())
    }

    async fn update_parcel(&self, row: ParcelRow) -> Result<(), StoreError> {
        self.insert_parcel(row).await
    }

    async fn find_product(
        &self,
        owner_id: &str,
        external_id: &str,
    ) -> Result<Option<ProductRow>, StoreError> {
        let state = self.state.lock().expect("store poisoned");
        Ok(state
            .products
            .get(&(owner_id.to_string(), external_id.to_string()))
            .cloned())
    }

    async fn find_product_by_id(&self, id: Uuid) -> Result<Option<ProductRow>, StoreError> {
        let state = self.state.lock().expect("store poisoned");
        Ok(state.products.values().find(|row| row.id == id).cloned())
    }

    async fn insert_product(&self, row: ProductRow) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("store poisoned");
        state
            .products
            .insert((row.owner_id.clone(), row.external_id.clone()), row);
        Ok(())
    }

    async fn update_product(&self, row: ProductRow) -> Result<(), StoreError> {
        self.insert_product(row).await
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, owner_id: &str) -> Result<Option<CredentialRecord>, StoreError> {
        let state = self.state.lock().expect("store poisoned");
        Ok(state.credentials.get(owner_id).cloned())
    }

    async fn put(&self, record: CredentialRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("store poisoned");
        state.credentials.insert(record.owner_id.clone(), record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CanonicalStatus, CookieJar};
    use chrono::Utc;

    fn parcel(owner: &str, external: &str) -> ParcelRow {
        let now = Utc::now();
        ParcelRow {
            id: Uuid::new_v4(),
            owner_id: owner.into(),
            external_id: external.into(),
            tracking_number: None,
            carrier: "Unknown".into(),
            weight: 0.0,
            status: CanonicalStatus::Pending,
            total_price: 0.0,
            price_per_unit: 0.0,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn parcels_key_by_owner_and_external_id() {
        let store = MemoryStore::new();
        store.insert_parcel(parcel("o1", "PN1")).await.unwrap();
        store.insert_parcel(parcel("o2", "PN1")).await.unwrap();
        assert_eq!(store.parcel_count(), 2);
        assert!(store.find_parcel("o1", "PN1").await.unwrap().is_some());
        assert!(store.find_parcel("o1", "PN2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn credentials_replace_wholesale() {
        let store = MemoryStore::new();
        let record = CredentialRecord {
            owner_id: "o1".into(),
            identifier: "user@example.com".into(),
            secret: "cipher".into(),
            cookie_jar: CookieJar::default(),
        };
        store.put(record.clone()).await.unwrap();
        let mut replaced = record;
        replaced.secret = "cipher2".into();
        store.put(replaced).await.unwrap();
        let loaded = store.get("o1").await.unwrap().unwrap();
        assert_eq!(loaded.secret, "cipher2");
    }

    #[test]
    fn base64_cipher_round_trips() {
        let cipher = Base64Cipher;
        let sealed = cipher.encrypt("hunter2");
        assert_ne!(sealed, "hunter2");
        assert_eq!(cipher.decrypt(&sealed).as_deref(), Some("hunter2"));
        assert_eq!(cipher.decrypt("not-base64!!!"), None);
    }
}
