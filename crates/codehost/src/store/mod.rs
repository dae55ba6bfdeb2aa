//! Session store: the source of truth mapping users to container leases.

mod models;
mod repository;

pub use models::Session;
pub use repository::SessionStore;
