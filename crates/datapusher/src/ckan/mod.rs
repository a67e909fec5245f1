//! CKAN action API access
//!
//! Only the four actions the push job needs are modelled: `resource_show`,
//! `resource_update`, `datastore_delete` and `datastore_create`.

pub mod client;
pub mod types;

pub use client::{CkanClient, CkanError};
pub use types::{ApiError, DatastoreField, Resource};
