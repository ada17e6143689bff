use std::time::Duration;

use mongodb::bson::doc;
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};

/// Thin wrapper around a MongoDB database handle providing connection setup.
#[derive(Clone)]
pub struct StoreClient {
    pub(crate) db: Database,
}

impl StoreClient {
    /// Connect and ping, so a bad URI fails at startup instead of on first write.
    pub async fn connect(uri: &str, database: &str) -> Result<Self, mongodb::error::Error> {
        let mut options = ClientOptions::parse(uri).await?;
        options.app_name = Some("cinestream".to_string());
        options.server_selection_timeout = Some(Duration::from_secs(5));
        options.max_pool_size = Some(10);

        let client = Client::with_options(options)?;
        let db = client.database(database);
        db.run_command(doc! { "ping": 1 }).await?;
        Ok(Self { db })
    }

    /// Get a reference to the underlying database.
    pub fn inner(&self) -> &Database {
        &self.db
    }
}
