//! presence-store: SQLite persistence for zones, persons and the attendance log.

mod schema;
pub mod sqlite;

pub use schema::SchemaError;
pub use sqlite::{AdminError, Person, SqliteStore};
