//! Donatrack Protocol
//!
//! Shared types between the donatrack server and its clients.
//! These types are serialized as JSON over the REST boundary.

use uuid::Uuid;

pub mod types;

pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
