//! Record store clients.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use reqwest::Client;
use uuid::Uuid;

use skiff_protocol::{NewRecord, RecordReceipt};

use super::error::{PersistenceError, PersistenceResult};

/// Append-only store of conversation records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Append one record to a session and return its durable id.
    async fn append(&self, session_id: &str, record: &NewRecord)
    -> PersistenceResult<RecordReceipt>;
}

/// Record store reached over HTTP: `POST {base}/sessions/{id}/messages`.
#[derive(Debug, Clone)]
pub struct HttpRecordStore {
    client: Client,
    base_url: String,
}

impl HttpRecordStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> PersistenceResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PersistenceError::Request(format!("building HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn handle_response(&self, response: reqwest::Response) -> PersistenceResult<RecordReceipt> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| PersistenceError::Decode(e.to_string()));
        }

        let message = response.text().await.unwrap_or_default();
        Err(PersistenceError::Status { status, message })
    }
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn append(
        &self,
        session_id: &str,
        record: &NewRecord,
    ) -> PersistenceResult<RecordReceipt> {
        let url = format!("{}/sessions/{}/messages", self.base_url, session_id);
        let response = self.client.post(&url).json(record).send().await?;
        let receipt = self.handle_response(response).await?;
        debug!(
            "Stored {} record {} for session {}",
            record.role, receipt.message_id, session_id
        );
        Ok(receipt)
    }
}

/// In-process record store for development without a backend.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: DashMap<String, Vec<(String, NewRecord)>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored records of a session, in append order.
    pub fn records(&self, session_id: &str) -> Vec<(String, NewRecord)> {
        self.records
            .get(session_id)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn append(
        &self,
        session_id: &str,
        record: &NewRecord,
    ) -> PersistenceResult<RecordReceipt> {
        let message_id = Uuid::new_v4().to_string();
        self.records
            .entry(session_id.to_string())
            .or_default()
            .push((message_id.clone(), record.clone()));
        Ok(RecordReceipt { message_id })
    }
}
