use super::models::{SourceInventory, TargetInventory};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DomainError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Source store error: {0}")]
    SourceStore(String),
    #[error("Target store error: {0}")]
    TargetStore(String),
    #[error("Unexpected schema: {0}")]
    Schema(String),
    #[error("Identifier collision: {0}")]
    IdentifierCollision(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid request: {0}")]
    Invalid(String),
}

impl From<rusqlite::Error> for DomainError {
    fn from(err: rusqlite::Error) -> Self {
        DomainError::SourceStore(err.to_string())
    }
}

impl From<postgres::Error> for DomainError {
    fn from(err: postgres::Error) -> Self {
        DomainError::TargetStore(err.to_string())
    }
}

impl From<r2d2::Error> for DomainError {
    fn from(err: r2d2::Error) -> Self {
        DomainError::TargetStore(err.to_string())
    }
}

impl From<reqwest::Error> for DomainError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DomainError::Timeout(err.to_string())
        } else {
            DomainError::Network(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SourceTotals {
    pub persons: i64,
    pub faces: i64,
    pub photos: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TargetTotals {
    pub assets: i64,
    pub faces: i64,
    pub clusters: i64,
}

/// Read side of the legacy store. Loads are whole-store: the pipeline
/// caches the inventory and never re-queries mid-analysis.
pub trait SourceRepository: Send + Sync {
    fn load(&self) -> Result<SourceInventory, DomainError>;
    fn totals(&self) -> Result<SourceTotals, DomainError>;
}

/// Read side of the Immich store.
pub trait TargetRepository: Send + Sync {
    fn load(&self) -> Result<TargetInventory, DomainError>;
    fn totals(&self) -> Result<TargetTotals, DomainError>;
}

/// A person as the target API reports it.
#[derive(Debug, Clone, Serialize)]
pub struct RemotePerson {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoteFaceCreate {
    pub asset_id: String,
    pub person_id: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub image_width: i32,
    pub image_height: i32,
}

/// Write side: the Immich HTTP API. One call per operation; the executor
/// owns sequencing, retries are deliberately absent.
#[async_trait]
pub trait TargetApi: Send + Sync {
    async fn ping(&self) -> Result<(), DomainError>;
    async fn get_person(&self, person_id: &str) -> Result<Option<RemotePerson>, DomainError>;
    async fn find_person_by_name(&self, name: &str) -> Result<Option<RemotePerson>, DomainError>;
    async fn create_person(&self, name: &str) -> Result<RemotePerson, DomainError>;
    async fn rename_person(&self, person_id: &str, name: &str) -> Result<(), DomainError>;
    async fn reassign_face(&self, face_id: &str, person_id: &str) -> Result<(), DomainError>;
    async fn create_face(&self, face: &RemoteFaceCreate) -> Result<(), DomainError>;
}
