pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod pagination;
pub mod routes;
pub mod store;
pub mod stripe;

use std::sync::Arc;

use crate::{config::AppConfig, store::Store, stripe::PaymentProcessor};

/// Shared handler state. The store and the payment processor sit behind
/// trait objects so the HTTP tests can swap in in-memory implementations.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub processor: Arc<dyn PaymentProcessor>,
    pub config: Arc<AppConfig>,
}
