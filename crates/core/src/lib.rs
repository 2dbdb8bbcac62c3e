//! AssetSync core library.
//!
//! This crate imports remote assets, together with their dependencies, into a
//! local project: a resumable transfer engine, a size-bounded metadata cache,
//! a durable index of what was imported, conflict resolution against local
//! copies, and the batch orchestrator that ties them together.

pub mod cache;
pub mod config;
pub mod conflict;
pub mod db;
pub mod errors;
pub mod events;
pub mod host;
pub mod import;
pub mod index;
pub mod models;
pub mod transfer;

// Re-exports for convenience.
pub use cache::CacheEvictor;
pub use config::AppConfig;
pub use conflict::ConflictResolver;
pub use db::Database;
pub use events::EventBus;
pub use import::{ImportOrchestrator, ImportServices, ImportSettings};
pub use index::LocalImportIndex;
pub use transfer::TransferEngine;
