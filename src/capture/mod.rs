//! Traffic capture: data model and durable stores

pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use memory::MemoryStore;
pub use models::{CapturedPair, CapturedRequest, CapturedResponse, FieldMap, RawHeaders, Scheme};
pub use postgres::PostgresStore;
pub use store::CaptureStore;
