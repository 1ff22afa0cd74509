use bson::doc;
use mongo_river::checkpoint::{Checkpoint, CheckpointStore};
use mongo_river::context::{QueueEntry, SharedContext};
use mongo_river::indexer::{run_indexer, CheckpointIndexer, Indexer};
use mongodb::change_stream::event::ResumeToken;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn token(data: &str) -> ResumeToken {
    bson::from_bson(bson::Bson::Document(doc! { "_data": data })).unwrap()
}

fn entry(source: &str, data: &str) -> QueueEntry {
    QueueEntry {
        source: source.to_string(),
        event: doc! { "operationType": "insert", "fullDocument": { "n": 1 } },
        resume_token: Some(token(data)),
    }
}

#[tokio::test]
async fn test_checkpoint_recovery_simulation() {
    let temp_dir = TempDir::new().unwrap();

    // Simulate first run
    {
        let store = CheckpointStore::new(temp_dir.path());
        assert!(store.load("shard0000").await.unwrap().is_none());

        let checkpoint = Checkpoint::new(
            "shard0000".to_string(),
            json!({ "_data": "82AAAA" }),
            500,
        );
        store.save(&checkpoint).await.unwrap();
    }

    // Simulate restart
    {
        let store = CheckpointStore::new(temp_dir.path());
        let loaded = store.load("shard0000").await.unwrap().expect("Should recover checkpoint");
        assert_eq!(loaded.resume_token, json!({ "_data": "82AAAA" }));
        assert_eq!(loaded.message_count, 500);

        // Other sources are independent
        assert!(store.load("shard0001").await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_indexer_resumes_each_source_from_its_last_event() {
    let temp_dir = TempDir::new().unwrap();
    let indexer = CheckpointIndexer::new(CheckpointStore::new(temp_dir.path()));

    indexer
        .index(vec![
            entry("shard0000", "8201"),
            entry("shard0001", "8210"),
            entry("shard0000", "8202"),
        ])
        .await
        .unwrap();

    // A fresh indexer over the same directory sees the same positions.
    let restarted = CheckpointIndexer::new(CheckpointStore::new(temp_dir.path()));
    assert_eq!(
        restarted.resume_token("shard0000").await.unwrap(),
        Some(token("8202"))
    );
    assert_eq!(
        restarted.resume_token("shard0001").await.unwrap(),
        Some(token("8210"))
    );
    assert_eq!(restarted.resume_token("shard0002").await.unwrap(), None);
}

#[tokio::test]
async fn test_queue_drains_into_checkpoints() {
    let temp_dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(temp_dir.path());
    let indexer: Arc<dyn Indexer> = Arc::new(CheckpointIndexer::new(CheckpointStore::new(
        temp_dir.path(),
    )));
    let (context, queue) = SharedContext::new(16);
    let cancel = CancellationToken::new();

    let task = tokio::spawn(run_indexer(
        queue,
        Arc::clone(&indexer),
        2,
        Duration::from_millis(10),
        cancel.clone(),
    ));

    for i in 0..3 {
        context
            .queue()
            .send(entry("mongodb", &format!("82{:02}", i)))
            .await
            .unwrap();
    }

    let mut saved = None;
    for _ in 0..100 {
        if let Some(checkpoint) = store.load("mongodb").await.unwrap() {
            if checkpoint.message_count == 3 {
                saved = Some(checkpoint);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    cancel.cancel();
    task.await.unwrap();

    let saved = saved.expect("all three events should be checkpointed");
    assert_eq!(saved.resume_token, json!({ "_data": "8202" }));
}
