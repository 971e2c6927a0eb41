use bucket_mirror::{
    backup::{BackupError, BackupJob},
    mirror::RunOptions,
    models::object::ObjectDescriptor,
    pipeline::RunControl,
    services::{
        memory_storage::{MemoryStorage, MemoryStorageFactory},
        registry::{BucketProvisioner, ManifestRegistry, TargetSettings},
        status_board::JobPhase,
        storage::Storage,
    },
};
use std::{sync::Arc, time::Duration};

const MANIFEST: &str = r#"{
    "claims": [
        {
            "namespace": "team-a",
            "name": "uploads",
            "bucket_name": "uploads-5f2c",
            "endpoint": "http://rgw:80",
            "access_key_id": "AK-A",
            "secret_access_key": "SK-A"
        },
        {
            "namespace": "team-b",
            "name": "logs",
            "bucket_name": "logs-9d1e",
            "endpoint": "http://rgw:80",
            "access_key_id": "AK-B",
            "secret_access_key": "SK-B"
        }
    ]
}"#;

fn settings() -> TargetSettings {
    TargetSettings {
        endpoint: "http://backup:9000".into(),
        access_key_id: "AK-T".into(),
        secret_access_key: "SK-T".into(),
        region: "us-east-1".into(),
        bucket_prefix: "backup".into(),
        namespace: "backup".into(),
    }
}

fn job(factory: Arc<MemoryStorageFactory>) -> BackupJob {
    let registry = Arc::new(ManifestRegistry::from_json(MANIFEST, settings()).unwrap());
    let provisioner = Arc::new(
        BucketProvisioner::new(registry.clone(), factory.clone())
            .with_readiness(2, Duration::from_millis(1)),
    );
    let options = RunOptions::default()
        .with_workers(4)
        .with_stats_interval(Duration::ZERO)
        .with_list_retry(1, Duration::ZERO);
    BackupJob::new(registry.clone(), registry, provisioner, factory, options)
}

fn seeded(bucket: &str, keys: &[&str]) -> Arc<MemoryStorage> {
    let storage = Arc::new(MemoryStorage::new(bucket));
    for key in keys {
        storage.insert(ObjectDescriptor::new(*key).with_payload(key.as_bytes().to_vec()));
    }
    storage
}

#[tokio::test]
async fn mirrors_every_claim_into_a_provisioned_target() {
    let factory = Arc::new(MemoryStorageFactory::new());
    factory.add(seeded("uploads-5f2c", &["a.png", "b.png"]));
    factory.add(seeded("logs-9d1e", &["2024-01-01.log"]));

    let job = job(factory.clone());
    let reports = job.run(&RunControl::new()).await.unwrap();

    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.is_success()));

    let uploads = factory.bucket("backup-team-a-uploads").unwrap();
    assert!(uploads.bucket_exists().await.unwrap());
    assert_eq!(uploads.keys(), ["a.png", "b.png"]);
    let logs = factory.bucket("backup-team-b-logs").unwrap();
    assert_eq!(logs.keys(), ["2024-01-01.log"]);

    let view = job.status_board().view();
    assert_eq!(view.phase, JobPhase::Succeeded);
    assert_eq!(view.completed.len(), 2);
    assert!(view.completed.iter().all(|s| s.success));
}

#[tokio::test]
async fn failing_pair_does_not_stop_the_others() {
    let factory = Arc::new(MemoryStorageFactory::new());
    // team-a's source bucket was never created.
    factory.add(Arc::new(MemoryStorage::missing("uploads-5f2c")));
    factory.add(seeded("logs-9d1e", &["2024-01-01.log"]));

    let job = job(factory.clone());
    let err = job.run(&RunControl::new()).await.unwrap_err();

    match &err {
        BackupError::PairsFailed(pairs) => assert_eq!(pairs, &["team-a/uploads"]),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(err.to_string(), "bucket pairs team-a/uploads failed");

    let logs = factory.bucket("backup-team-b-logs").unwrap();
    assert_eq!(logs.keys(), ["2024-01-01.log"]);

    let view = job.status_board().view();
    assert_eq!(view.phase, JobPhase::Failed);
    let failed = view
        .completed
        .iter()
        .find(|s| s.name == "team-a/uploads")
        .unwrap();
    assert!(!failed.success);
    assert!(failed.error.as_deref().unwrap().contains("configuration"));
}

#[tokio::test]
async fn drained_job_attempts_no_pairs() {
    let factory = Arc::new(MemoryStorageFactory::new());
    factory.add(seeded("uploads-5f2c", &["a.png"]));
    factory.add(seeded("logs-9d1e", &["x.log"]));

    let control = RunControl::new();
    control.drain();
    let err = job(factory.clone()).run(&control).await.unwrap_err();

    assert!(matches!(err, BackupError::PairsFailed(ref pairs) if pairs.len() == 2));
    assert!(factory.bucket("backup-team-a-uploads").is_none());
}
