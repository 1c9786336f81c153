//! Fact store: the durable row store, its FTS5 index, and the
//! fact-link graph table. `SqliteFactStore` is the only implementation;
//! a trait isn't introduced here because, unlike the vector store,
//! there is no second backend to swap in. It stays synchronous, in
//! contrast to the async vector store.

mod fts;
mod migrations;
mod sqlite;

pub use fts::sanitize_fts5_query;
pub use migrations::{apply_migrations, get_current_version};
pub use sqlite::{
    classify_decay, normalized_hash, CompactionParams, CompactionReport, SqliteFactStore,
    StoreStats, TraversalHit,
};
