//! PostgREST-backed implementation of the store traits for hosted
//! deployments. Row shapes serialize straight from `models`.

use crate::http::build_client;
use crate::models::{CredentialRecord, ParcelRow, ProductRow};
use crate::store::{CredentialStore, StoreError, SyncStore};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SupabaseStore {
    base_url: String,
    service_key: String,
    http: Client,
}

impl SupabaseStore {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: build_client(),
        })
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn find_one<T: DeserializeOwned>(
        &self,
        table: &str,
        filter: &str,
    ) -> Result<Option<T>, StoreError> {
        let url = format!(
            "{}/rest/v1/{table}?{filter}&select=*&limit=1",
            self.base_url
        );
        let response = self
            .authed(self.http.get(url))
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }

        let mut payload: Vec<T> = response
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))?;
        Ok(payload.pop())
    }

    async fn insert_row<T: Serialize>(&self, table: &str, row: &T) -> Result<(), StoreError> {
        let url = format!("{}/rest/v1/{table}", self.base_url);
        let response = self
            .authed(self.http.post(url))
            .header("Prefer", "return=minimal")
            .json(row)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }
        Ok(())
    }

    async fn update_row<T: Serialize>(
        &self,
        table: &str,
        filter: &str,
        row: &T,
    ) -> Result<(), StoreError> {
        let url = format!("{}/rest/v1/{table}?{filter}", self.base_url);
        let response = self
            .authed(self.http.patch(url))
            .header("Prefer", "return=minimal")
            .json(row)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}

fn identity_filter(owner_id: &str, external_id: &str) -> String {
    format!("owner_id=eq.{owner_id}&external_id=eq.{external_id}")
}

#[async_trait]
impl SyncStore for SupabaseStore {
    async fn find_parcel(
        &self,
        owner_id: &str,
        external_id: &str,
    ) -> Result<Option<ParcelRow>, StoreError> {
        self.find_one("parcels", &identity_filter(owner_id, external_id))
            .await
    }

    async fn insert_parcel(&self, row: ParcelRow) -> Result<(), StoreError> {
        self.insert_row("parcels", &row).await
    }

    async fn update_parcel(&self, row: ParcelRow) -> Result<(), StoreError> {
        self.update_row("parcels", &format!("id=eq.{}", row.id), &row)
            .await
    }

    async fn find_product(
        &self,
        owner_id: &str,
        external_id: &str,
    ) -> Result<Option<ProductRow>, StoreError> {
        self.find_one("products", &identity_filter(owner_id, external_id))
            .await
    }

    async fn find_product_by_id(&self, id: Uuid) -> Result<Option<ProductRow>, StoreError> {
        self.find_one("products", &format!("id=eq.{id}")).await
    }

    async fn insert_product(&self, row: ProductRow) -> Result<(), StoreError> {
        self.insert_row("products", &row).await
    }

    async fn update_product(&self, row: ProductRow) -> Result<(), StoreError> {
        self.update_row("products", &format!("id=eq.{}", row.id), &row)
            .await
    }
}

#[async_trait]
impl CredentialStore for SupabaseStore {
    async fn get(&self, owner_id: &str) -> Result<Option<CredentialRecord>, StoreError> {
        self.find_one("upstream_credentials", &format!("owner_id=eq.{owner_id}"))
            .await
    }

    async fn put(&self, record: CredentialRecord) -> Result<(), StoreError> {
        let existing: Option<CredentialRecord> = self
            .find_one(
                "upstream_credentials",
                &format!("owner_id=eq.{}", record.owner_id),
            )
            .await?;
        if existing.is_some() {
            self.update_row(
                "upstream_credentials",
                &format!("owner_id=eq.{}", record.owner_id),
                &record,
            )
            .await
        } else {
            self.insert_row("upstream_credentials", &record).await
        }
    }
}
