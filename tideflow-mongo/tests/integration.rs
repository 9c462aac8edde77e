//! Requires a reachable MongoDB (e.g. `docker run -p 27017:27017 mongo:7`).
//! Run with `cargo test -p tideflow-mongo -- --ignored`.

use mongodb::options::ClientOptions;
use tideflow::{DocumentStore, Pingable};
use tideflow_mongo::MongoDocumentStore;

async fn store() -> MongoDocumentStore {
    let url =
        std::env::var("MONGO_URL").unwrap_or_else(|_| "mongodb://127.0.0.1:27017".into());
    let options = ClientOptions::parse(&url).await.expect("mongo options");
    let client = mongodb::Client::with_options(options).expect("mongo client");
    MongoDocumentStore::new(client.database("tideflow_it"))
}

#[tokio::test]
#[ignore]
async fn create_then_probe_round_trip() {
    let store = store().await;
    store.ping().await.unwrap();

    let entity_id = format!("it-{}", std::process::id());
    let metadata = serde_json::json!({"department": "treasury", "tier": 3});

    assert_eq!(store.find_by_entity("Account", &entity_id).await.unwrap(), None);
    store.create("Account", &entity_id, &metadata).await.unwrap();
    assert_eq!(
        store.find_by_entity("Account", &entity_id).await.unwrap(),
        Some(metadata)
    );
}
