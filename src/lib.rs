pub mod catalog;
pub mod config;
pub mod count_cache;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod query_builder;
pub mod query_parser;
pub mod release;
pub mod response;
pub mod shaper;
pub mod structure;

use sqlx::PgPool;
use std::sync::Arc;

use config::Settings;
use count_cache::CountCache;
use release::ReleaseTracker;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub counts: Arc<CountCache>,
    pub release: Arc<ReleaseTracker>,
    pub settings: Arc<Settings>,
}
