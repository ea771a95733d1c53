#![allow(dead_code)]

use serde_json::json;
use std::time::Duration;
use stevedore::{FetchOptions, QueueOptionsBuilder, SendOptions};

mod helpers;

#[tokio::test]
async fn fetch_claims_in_priority_then_creation_order() {
    helpers::with_test_db(|test_db| async move {
        let manager = test_db
            .create_manager_options()
            .connect()
            .await
            .expect("Failed to start manager");

        manager
            .create_queue("ordered", Default::default())
            .await
            .expect("Failed to create queue");

        let low = manager
            .send("ordered", &json!({ "p": 0 }), SendOptions::default())
            .await
            .unwrap()
            .unwrap();
        let high = manager
            .send(
                "ordered",
                &json!({ "p": 9 }),
                stevedore::SendOptionsBuilder::default()
                    .priority(9)
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap()
            .unwrap();

        let batch = manager
            .fetch(
                "ordered",
                FetchOptions {
                    batch_size: 2,
                    ..Default::default()
                },
            )
            .await
            .expect("Failed to fetch");

        assert_eq!(batch.len(), 2);
        assert_eq!(*batch[0].id(), high);
        assert_eq!(*batch[1].id(), low);
        assert_eq!(test_db.count_in_state("ordered", "active").await, 2);
    })
    .await;
}

#[tokio::test]
async fn fetch_with_metadata_returns_the_full_row() {
    helpers::with_test_db(|test_db| async move {
        let manager = test_db
            .create_manager_options()
            .connect()
            .await
            .expect("Failed to start manager");

        manager
            .create_queue("meta", Default::default())
            .await
            .expect("Failed to create queue");
        manager
            .send("meta", &json!({}), SendOptions::default())
            .await
            .unwrap();

        let lean = manager.fetch("meta", Default::default()).await.unwrap();
        assert_eq!(lean.len(), 1);
        assert!(lean[0].state().is_none());
        assert!(lean[0].created_on().is_none());

        manager
            .send("meta", &json!({}), SendOptions::default())
            .await
            .unwrap();
        let full = manager
            .fetch(
                "meta",
                FetchOptions {
                    include_metadata: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(full.len(), 1);
        assert_eq!(full[0].state(), &Some(stevedore::JobState::Active));
        assert!(full[0].started_on().is_some());
    })
    .await;
}

#[tokio::test]
async fn complete_is_idempotent() {
    helpers::with_test_db(|test_db| async move {
        let manager = test_db
            .create_manager_options()
            .connect()
            .await
            .expect("Failed to start manager");

        manager
            .create_queue("done", Default::default())
            .await
            .expect("Failed to create queue");
        manager
            .send("done", &json!({}), SendOptions::default())
            .await
            .unwrap();

        let batch = manager.fetch("done", Default::default()).await.unwrap();
        let ids = vec![*batch[0].id()];

        let first = manager
            .complete("done", &ids, Some(json!({ "ok": true })))
            .await
            .expect("Failed to complete");
        assert_eq!(first.affected, 1);
        assert_eq!(first.requested, 1);

        let repeat = manager.complete("done", &ids, None).await.unwrap();
        assert_eq!(repeat.affected, 0, "completing twice affects nothing");

        let jobs = test_db.get_jobs("done").await;
        assert_eq!(jobs[0].state, "completed");
        assert_eq!(jobs[0].output, Some(json!({ "ok": true })));
        assert!(jobs[0].completed_on.is_some());
    })
    .await;
}

#[tokio::test]
async fn complete_wraps_scalar_output() {
    helpers::with_test_db(|test_db| async move {
        let manager = test_db
            .create_manager_options()
            .connect()
            .await
            .expect("Failed to start manager");

        manager
            .create_queue("scalar", Default::default())
            .await
            .expect("Failed to create queue");
        manager
            .send("scalar", &json!({}), SendOptions::default())
            .await
            .unwrap();

        let batch = manager.fetch("scalar", Default::default()).await.unwrap();
        manager
            .complete("scalar", &[*batch[0].id()], Some(json!(42)))
            .await
            .unwrap();

        let jobs = test_db.get_jobs("scalar").await;
        assert_eq!(jobs[0].output, Some(json!({ "value": 42 })));
    })
    .await;
}

#[tokio::test]
async fn cancel_and_resume_round_trip() {
    helpers::with_test_db(|test_db| async move {
        let manager = test_db
            .create_manager_options()
            .connect()
            .await
            .expect("Failed to start manager");

        manager
            .create_queue("cancellable", Default::default())
            .await
            .expect("Failed to create queue");
        let id = manager
            .send("cancellable", &json!({}), SendOptions::default())
            .await
            .unwrap()
            .unwrap();

        let cancelled = manager.cancel("cancellable", &[id]).await.unwrap();
        assert_eq!(cancelled.affected, 1);
        assert_eq!(test_db.get_jobs("cancellable").await[0].state, "cancelled");

        // Cancelling a terminal job is a no-op.
        let repeat = manager.cancel("cancellable", &[id]).await.unwrap();
        assert_eq!(repeat.affected, 0);

        let resumed = manager.resume("cancellable", &[id]).await.unwrap();
        assert_eq!(resumed.affected, 1);
        assert_eq!(test_db.get_jobs("cancellable").await[0].state, "created");

        // Resuming a live job is a no-op too.
        let repeat = manager.resume("cancellable", &[id]).await.unwrap();
        assert_eq!(repeat.affected, 0);
    })
    .await;
}

#[tokio::test]
async fn delete_job_removes_rows() {
    helpers::with_test_db(|test_db| async move {
        let manager = test_db
            .create_manager_options()
            .connect()
            .await
            .expect("Failed to start manager");

        manager
            .create_queue("disposable", Default::default())
            .await
            .expect("Failed to create queue");
        let id = manager
            .send("disposable", &json!({}), SendOptions::default())
            .await
            .unwrap()
            .unwrap();

        let deleted = manager.delete_job("disposable", &[id]).await.unwrap();
        assert_eq!(deleted.affected, 1);
        assert!(test_db.get_jobs("disposable").await.is_empty());

        let missing = manager.delete_job("disposable", &[id]).await.unwrap();
        assert_eq!(missing.affected, 0);
    })
    .await;
}

#[tokio::test]
async fn get_job_by_id_reads_live_and_archived_rows() {
    helpers::with_test_db(|test_db| async move {
        let manager = test_db
            .create_manager_options()
            .archive_completed_after(Duration::ZERO)
            .connect()
            .await
            .expect("Failed to start manager");

        manager
            .create_queue("lookup", Default::default())
            .await
            .expect("Failed to create queue");
        let id = manager
            .send("lookup", &json!({ "k": "v" }), SendOptions::default())
            .await
            .unwrap()
            .unwrap();

        let live = manager
            .get_job_by_id("lookup", id, false)
            .await
            .unwrap()
            .expect("live job should be found");
        assert_eq!(live.data(), &Some(json!({ "k": "v" })));

        // Complete it and archive it away.
        let batch = manager.fetch("lookup", Default::default()).await.unwrap();
        manager.complete("lookup", &[*batch[0].id()], None).await.unwrap();

        let summary = manager.maintain().await.expect("Failed to maintain");
        assert_eq!(summary.archived, 1);

        assert!(manager.get_job_by_id("lookup", id, false).await.unwrap().is_none());

        let archived = manager
            .get_job_by_id("lookup", id, true)
            .await
            .unwrap()
            .expect("archived job should be found");
        assert_eq!(archived.state(), &Some(stevedore::JobState::Completed));

        let archive_rows = test_db.get_archived_jobs("lookup").await;
        assert_eq!(archive_rows.len(), 1);
    })
    .await;
}

#[tokio::test]
async fn expired_claims_are_reaped_by_maintenance() {
    helpers::with_test_db(|test_db| async move {
        let manager = test_db
            .create_manager_options()
            .connect()
            .await
            .expect("Failed to start manager");

        manager
            .create_queue(
                "expiring",
                QueueOptionsBuilder::default()
                    .expire_in_seconds(1)
                    .retry_limit(0)
                    .build()
                    .unwrap(),
            )
            .await
            .expect("Failed to create queue");
        manager
            .send("expiring", &json!({}), SendOptions::default())
            .await
            .unwrap();

        let batch = manager.fetch("expiring", Default::default()).await.unwrap();
        assert_eq!(batch.len(), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;

        let summary = manager.maintain().await.expect("Failed to maintain");
        assert_eq!(summary.expired, 1);

        let jobs = test_db.get_jobs("expiring").await;
        assert_eq!(jobs[0].state, "failed");
        let message = jobs[0].output.as_ref().unwrap()["message"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(message.contains("timeout"));
    })
    .await;
}

#[tokio::test]
async fn singleton_queue_activates_one_job_at_a_time() {
    helpers::with_test_db(|test_db| async move {
        let manager = test_db
            .create_manager_options()
            .connect()
            .await
            .expect("Failed to start manager");

        manager
            .create_queue(
                "serial",
                QueueOptionsBuilder::default()
                    .policy(stevedore::QueuePolicy::Singleton)
                    .build()
                    .unwrap(),
            )
            .await
            .expect("Failed to create queue");

        let mut sent = Vec::new();
        for i in 0..3 {
            sent.push(
                manager
                    .send("serial", &json!({ "i": i }), SendOptions::default())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }

        let mut completed = Vec::new();
        loop {
            let batch = manager.fetch("serial", Default::default()).await.unwrap();
            let Some(job) = batch.first() else {
                break;
            };

            // The unique index caps activation at one; a competing fetch
            // while this job runs comes back empty.
            assert!(test_db.count_in_state("serial", "active").await <= 1);
            let contended = manager.fetch("serial", Default::default()).await.unwrap();
            assert!(contended.is_empty());

            completed.push(*job.id());
            manager.complete("serial", &[*job.id()], None).await.unwrap();
        }

        assert_eq!(completed, sent, "jobs complete in send order");
    })
    .await;
}
