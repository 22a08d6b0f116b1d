pub mod config;
pub mod database;
pub mod dto;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;

use crate::services::{
    merge_queue::MergeQueue,
    merge_service::{MergeService, MergeSettings},
    proctoring_service::ProctoringService,
    storage_service::{StorageService, StorageSettings},
};
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub storage: Arc<StorageService>,
    pub proctoring: ProctoringService,
    pub merge_service: MergeService,
    pub merge_queue: Arc<MergeQueue>,
}

impl AppState {
    pub async fn new(pool: PgPool) -> crate::error::Result<Self> {
        let config = crate::config::get_config();

        // Backend selection happens exactly once here; every later put
        // and get goes to the same target.
        let storage = Arc::new(StorageService::new(StorageSettings::from_config(config)).await?);
        let proctoring = ProctoringService::new(pool.clone(), storage.clone());
        let merge_service = MergeService::new(
            proctoring.clone(),
            storage.clone(),
            MergeSettings::from_config(config),
        );

        Ok(Self {
            pool,
            storage,
            proctoring,
            merge_service,
            merge_queue: Arc::new(MergeQueue::new()),
        })
    }
}
