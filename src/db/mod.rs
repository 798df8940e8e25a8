//! Database module for uptrail.
//!
//! Storage interfaces used by the engine plus a SQLite implementation with
//! embedded migrations.

mod crypto;
mod models;
mod store;
mod traits;

pub use crypto::FieldCipher;
pub use models::*;
pub use store::*;
pub use traits::*;
