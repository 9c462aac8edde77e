#![forbid(unsafe_code)]

//! MongoDB adapter for the `tideflow` document store port (companion
//! crate).
//!
//! Bring your own `mongodb::Database`; each entity type maps to a
//! collection, and documents are keyed by `entity_id` so the outbox
//! worker's idempotency probe is a single indexed lookup.

use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};
use mongodb::Database;
use serde_json::Value;
use tideflow::{DocumentStore, Error, Pingable};

const ENTITY_ID_FIELD: &str = "entity_id";
const METADATA_FIELD: &str = "metadata";

fn document_err(err: impl std::fmt::Display) -> Error {
    Error::Document(err.to_string())
}

/// Document store over a database handle.
#[derive(Clone)]
pub struct MongoDocumentStore {
    database: Database,
}

impl std::fmt::Debug for MongoDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MongoDocumentStore({})", self.database.name())
    }
}

impl MongoDocumentStore {
    pub fn new(database: Database) -> Self {
        Self { database }
    }
}

#[async_trait]
impl Pingable for MongoDocumentStore {
    async fn ping(&self) -> Result<(), Error> {
        self.database
            .run_command(doc! {"ping": 1}, None)
            .await
            .map_err(document_err)?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    async fn find_by_entity(
        &self,
        collection: &str,
        entity_id: &str,
    ) -> Result<Option<Value>, Error> {
        let found: Option<Document> = self
            .database
            .collection::<Document>(collection)
            .find_one(doc! {ENTITY_ID_FIELD: entity_id}, None)
            .await
            .map_err(document_err)?;

        match found.and_then(|mut document| document.remove(METADATA_FIELD)) {
            Some(bson) => {
                let value = serde_json::to_value(bson).map_err(document_err)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn create(
        &self,
        collection: &str,
        entity_id: &str,
        document: &Value,
    ) -> Result<(), Error> {
        let metadata: Bson =
            mongodb::bson::to_bson(document).map_err(document_err)?;
        self.database
            .collection::<Document>(collection)
            .insert_one(doc! {ENTITY_ID_FIELD: entity_id, METADATA_FIELD: metadata}, None)
            .await
            .map_err(document_err)?;
        Ok(())
    }
}
