pub mod client;
pub mod documents;
pub mod migrate;
pub mod store;
#[cfg(feature = "test-utils")]
pub mod testutil;

pub use client::StoreClient;
pub use store::{is_duplicate_key, MongoStore, LOCATIONS, MOVIES};
