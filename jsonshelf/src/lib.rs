pub mod cache;
pub mod config;
pub mod connection;
pub mod document;
pub mod error;
pub mod fts;
pub mod query;
pub mod store;
pub mod validation;

pub use config::{CacheConfig, IdStrategy, StoreConfig};
pub use connection::Connection;
pub use document::{Document, ID_FIELD};
pub use error::{Result, ShelfError};
pub use fts::IndexDescriptor;
pub use query::{Direction, Operator, Query};
pub use store::{Collection, QueryBuilder, Store};
