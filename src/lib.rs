//! # adsync
//!
//! Multi-tenant sync service for ad-platform and storefront metrics. Tenants
//! connect Google Ads, Meta and Shopify accounts over OAuth; a scheduler and a
//! bounded worker pool pull campaigns and daily metrics into a local store.

pub mod adapters;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod oauth;
pub mod queue;
pub mod repositories;
pub mod scheduler;
pub mod server;
pub mod services;
pub mod telemetry;
pub mod worker;
pub use migration;
