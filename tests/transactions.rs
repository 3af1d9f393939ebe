mod helpers;

use cloud_backup::{
    errors::VaultError,
    models::upload::UploadState,
    services::{
        delete_manager::DeleteTransactionManager,
        identity::AuthError,
        ledger::FileLedger,
        object_store::{ObjectStore, ObjectStoreError, owner_namespace},
        reconcile::Reconciler,
        upload_manager::{UploadRequest, UploadTransactionManager},
    },
};
use helpers::{Harness, chunked, payload, stalled};
use std::time::Duration;
use tokio::time::timeout;

fn managers(h: &Harness) -> (UploadTransactionManager, DeleteTransactionManager) {
    (
        UploadTransactionManager::new(h.store(), h.ledger()),
        DeleteTransactionManager::new(h.store(), h.ledger()),
    )
}

fn request(name: &str, data: Vec<u8>) -> UploadRequest {
    UploadRequest {
        name: name.to_string(),
        size_bytes: data.len() as u64,
        source: chunked(data, 64 * 1024),
    }
}

#[tokio::test]
async fn upload_is_recorded_for_its_owner_only() {
    let h = Harness::new().await;
    let (uploads, _) = managers(&h);
    let (gate_a, alice) = h.sign_up("alice@example.com").await;
    let (_, bob) = h.sign_up("bob@example.com").await;

    let data = payload(1_048_576);
    let expected_checksum = format!("{:x}", md5::compute(&data));
    let record = uploads
        .upload(&gate_a, &alice, request("report.pdf", data))
        .await
        .unwrap();

    assert_eq!(record.owner_id, alice.principal);
    assert_eq!(record.name, "report.pdf");
    assert_eq!(record.size_bytes, 1_048_576);
    assert_eq!(record.checksum, expected_checksum);
    assert!(
        record
            .locator
            .as_str()
            .starts_with(&format!("{}/", owner_namespace(alice.principal)))
    );
    assert_eq!(
        h.store.content_length(&record.locator).await.unwrap(),
        Some(1_048_576)
    );

    let listed = h.ledger.list_for(alice.principal).await.unwrap();
    assert_eq!(listed, vec![record]);
    assert!(h.ledger.list_for(bob.principal).await.unwrap().is_empty());
}

#[tokio::test]
async fn same_name_uploads_get_distinct_locators() {
    let h = Harness::new().await;
    let (uploads, _) = managers(&h);
    let (gate, session) = h.sign_up("alice@example.com").await;

    let first = uploads
        .upload(&gate, &session, request("notes.txt", payload(10)))
        .await
        .unwrap();
    let second = uploads
        .upload(&gate, &session, request("notes.txt", payload(20)))
        .await
        .unwrap();

    assert_ne!(first.locator, second.locator);
    let listed = h.ledger.list_for(session.principal).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second.id, "newest first");
}

#[tokio::test]
async fn progress_only_moves_forward_and_completes() {
    let h = Harness::new().await;
    let (uploads, _) = managers(&h);
    let (gate, session) = h.sign_up("alice@example.com").await;

    let total = 300_000usize;
    let handle = uploads
        .start(
            &gate,
            &session,
            UploadRequest {
                name: "big.bin".into(),
                size_bytes: total as u64,
                source: chunked(payload(total), 4096),
            },
        )
        .await
        .unwrap();

    let mut rx = handle.progress();
    let observer = tokio::spawn(async move {
        let mut seen = Vec::new();
        while rx.changed().await.is_ok() {
            seen.push(*rx.borrow_and_update());
        }
        seen
    });

    handle.finish().await.unwrap();
    let seen = observer.await.unwrap();

    assert!(!seen.is_empty());
    assert!(
        seen.windows(2)
            .all(|w| w[0].bytes_transferred <= w[1].bytes_transferred)
    );
    let last = seen.last().unwrap();
    assert_eq!(last.state, UploadState::Completed);
    assert_eq!(last.bytes_transferred, total as u64);
    assert_eq!(last.fraction(), 1.0);
}

#[tokio::test]
async fn failed_object_write_records_nothing() {
    let h = Harness::new().await;
    let (uploads, _) = managers(&h);
    let (gate, session) = h.sign_up("alice@example.com").await;
    h.store.fail_writes(true);

    let err = uploads
        .upload(&gate, &session, request("a.txt", payload(100)))
        .await
        .unwrap_err();

    assert!(matches!(err, VaultError::ObjectWriteFailed { .. }));
    let usage = h.ledger.usage_for(session.principal).await.unwrap();
    assert_eq!(usage.file_count, 0);
}

#[tokio::test]
async fn short_payload_is_rejected_and_leaves_no_object() {
    let h = Harness::new().await;
    let (uploads, _) = managers(&h);
    let (gate, session) = h.sign_up("alice@example.com").await;

    let err = uploads
        .upload(
            &gate,
            &session,
            UploadRequest {
                name: "short.bin".into(),
                size_bytes: 10,
                source: chunked(payload(5), 2),
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        VaultError::ObjectWriteFailed {
            source: ObjectStoreError::SizeMismatch {
                expected: 10,
                actual: 5
            },
            ..
        }
    ));
    let objects = h
        .store
        .list_namespace(&owner_namespace(session.principal))
        .await
        .unwrap();
    assert!(objects.is_empty());
    assert!(h.ledger.list_for(session.principal).await.unwrap().is_empty());
}

#[tokio::test]
async fn ledger_failure_reports_orphaned_locator() {
    let h = Harness::new().await;
    let (uploads, _) = managers(&h);
    let (gate, session) = h.sign_up("alice@example.com").await;
    h.ledger.fail_inserts(true);

    let err = uploads
        .upload(&gate, &session, request("a.txt", payload(100)))
        .await
        .unwrap_err();

    let VaultError::MetadataWriteFailed { locator, .. } = err else {
        panic!("expected MetadataWriteFailed, got {err:?}");
    };
    assert_eq!(h.store.content_length(&locator).await.unwrap(), Some(100));
    assert!(h.ledger.list_for(session.principal).await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_writing() {
    let h = Harness::new().await;
    let (uploads, _) = managers(&h);
    let (gate, session) = h.sign_up("alice@example.com").await;

    let empty = uploads
        .upload(&gate, &session, request("empty.txt", Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(empty, VaultError::InvalidUpload(_)));

    let unnamed = uploads
        .upload(&gate, &session, request("   ", payload(3)))
        .await
        .unwrap_err();
    assert!(matches!(unnamed, VaultError::InvalidUpload(_)));
}

#[tokio::test]
async fn upload_requires_a_live_session() {
    let h = Harness::new().await;
    let (uploads, _) = managers(&h);
    let (gate, session) = h.sign_up("alice@example.com").await;
    gate.logout().await;

    let err = uploads
        .upload(&gate, &session, request("a.txt", payload(3)))
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Auth(AuthError::Unauthenticated)));
}

#[tokio::test]
async fn cancelled_upload_records_nothing() {
    let h = Harness::new().await;
    let (uploads, _) = managers(&h);
    let (gate, session) = h.sign_up("alice@example.com").await;

    let handle = uploads
        .start(
            &gate,
            &session,
            UploadRequest {
                name: "slow.bin".into(),
                size_bytes: 1_000,
                source: stalled(b"abc"),
            },
        )
        .await
        .unwrap();
    let progress = handle.progress();
    handle.cancel();

    let err = timeout(Duration::from_secs(5), handle.finish())
        .await
        .expect("cancelled upload should settle")
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(progress.borrow().state, UploadState::Cancelled);
    assert!(h.ledger.list_for(session.principal).await.unwrap().is_empty());
}

#[tokio::test]
async fn logout_cancels_in_flight_upload() {
    let h = Harness::new().await;
    let (uploads, _) = managers(&h);
    let (gate, session) = h.sign_up("alice@example.com").await;

    let handle = uploads
        .start(
            &gate,
            &session,
            UploadRequest {
                name: "slow.bin".into(),
                size_bytes: 1_000,
                source: stalled(b"abc"),
            },
        )
        .await
        .unwrap();
    gate.logout().await;

    let err = timeout(Duration::from_secs(5), handle.finish())
        .await
        .expect("upload should stop after logout")
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(h.ledger.list_for(session.principal).await.unwrap().is_empty());
}

#[tokio::test]
async fn cancel_after_durable_write_records_nothing() {
    let h = Harness::new().await;
    let (uploads, _) = managers(&h);
    let (gate, session) = h.sign_up("alice@example.com").await;
    h.store.ignore_cancel(true);

    let handle = uploads
        .start(&gate, &session, request("late.txt", payload(1_000)))
        .await
        .unwrap();
    let progress = handle.progress();
    handle.cancel();

    let err = handle.finish().await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(progress.borrow().state, UploadState::Cancelled);
    assert!(h.ledger.list_for(session.principal).await.unwrap().is_empty());
    let objects = h
        .store
        .list_namespace(&owner_namespace(session.principal))
        .await
        .unwrap();
    assert!(objects.is_empty());
}

#[tokio::test]
async fn logout_after_durable_write_records_nothing() {
    let h = Harness::new().await;
    let (uploads, _) = managers(&h);
    let (gate, session) = h.sign_up("alice@example.com").await;
    h.store.ignore_cancel(true);

    let handle = uploads
        .start(&gate, &session, request("late.txt", payload(1_000)))
        .await
        .unwrap();
    gate.logout().await;

    let err = handle.finish().await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(h.ledger.list_for(session.principal).await.unwrap().is_empty());
    let objects = h
        .store
        .list_namespace(&owner_namespace(session.principal))
        .await
        .unwrap();
    assert!(objects.is_empty());
}

#[tokio::test]
async fn delete_removes_object_then_record() {
    let h = Harness::new().await;
    let (uploads, deletes) = managers(&h);
    let (gate, session) = h.sign_up("alice@example.com").await;
    let record = uploads
        .upload(&gate, &session, request("a.txt", payload(100)))
        .await
        .unwrap();

    let deleted = deletes
        .delete_by_id(&gate, &session, record.id)
        .await
        .unwrap();

    assert_eq!(deleted.id, record.id);
    assert_eq!(h.store.content_length(&record.locator).await.unwrap(), None);
    assert!(h.ledger.list_for(session.principal).await.unwrap().is_empty());

    let again = deletes
        .delete_by_id(&gate, &session, record.id)
        .await
        .unwrap_err();
    assert!(matches!(again, VaultError::NotFound(id) if id == record.id));
}

#[tokio::test]
async fn failed_object_delete_keeps_record_and_retry_succeeds() {
    let h = Harness::new().await;
    let (uploads, deletes) = managers(&h);
    let (gate, session) = h.sign_up("alice@example.com").await;
    let record = uploads
        .upload(&gate, &session, request("a.txt", payload(100)))
        .await
        .unwrap();

    h.store.fail_deletes(true);
    let err = deletes.delete(&gate, &session, &record).await.unwrap_err();
    assert!(matches!(
        err,
        VaultError::ObjectDeleteFailed { record_id, .. } if record_id == record.id
    ));
    assert_eq!(
        h.ledger.list_for(session.principal).await.unwrap(),
        vec![record.clone()]
    );
    assert_eq!(
        h.store.content_length(&record.locator).await.unwrap(),
        Some(100)
    );

    h.store.fail_deletes(false);
    deletes.delete(&gate, &session, &record).await.unwrap();
    assert!(h.ledger.list_for(session.principal).await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_tolerates_an_already_missing_object() {
    let h = Harness::new().await;
    let (uploads, deletes) = managers(&h);
    let (gate, session) = h.sign_up("alice@example.com").await;
    let record = uploads
        .upload(&gate, &session, request("a.txt", payload(100)))
        .await
        .unwrap();
    h.store.delete_by_locator(&record.locator).await.unwrap();

    deletes.delete(&gate, &session, &record).await.unwrap();
    assert!(h.ledger.list_for(session.principal).await.unwrap().is_empty());
}

#[tokio::test]
async fn cannot_delete_another_owners_file() {
    let h = Harness::new().await;
    let (uploads, deletes) = managers(&h);
    let (gate_a, alice) = h.sign_up("alice@example.com").await;
    let (gate_b, bob) = h.sign_up("bob@example.com").await;
    let record = uploads
        .upload(&gate_a, &alice, request("a.txt", payload(100)))
        .await
        .unwrap();

    let direct = deletes.delete(&gate_b, &bob, &record).await.unwrap_err();
    assert!(matches!(direct, VaultError::NotFound(_)));
    let by_id = deletes
        .delete_by_id(&gate_b, &bob, record.id)
        .await
        .unwrap_err();
    assert!(matches!(by_id, VaultError::NotFound(_)));

    assert_eq!(h.ledger.list_for(alice.principal).await.unwrap().len(), 1);
    assert_eq!(
        h.store.content_length(&record.locator).await.unwrap(),
        Some(100)
    );
}

#[tokio::test]
async fn reconcile_finds_and_repairs_both_kinds_of_debris() {
    let h = Harness::new().await;
    let (uploads, deletes) = managers(&h);
    let (gate, session) = h.sign_up("alice@example.com").await;

    let kept = uploads
        .upload(&gate, &session, request("kept.txt", payload(10)))
        .await
        .unwrap();

    // Object without a record.
    h.ledger.fail_inserts(true);
    let VaultError::MetadataWriteFailed { locator: orphan, .. } = uploads
        .upload(&gate, &session, request("orphan.txt", payload(20)))
        .await
        .unwrap_err()
    else {
        panic!("expected MetadataWriteFailed");
    };
    h.ledger.fail_inserts(false);

    // Record without an object.
    let dangling = uploads
        .upload(&gate, &session, request("dangling.txt", payload(30)))
        .await
        .unwrap();
    h.ledger.fail_deletes(true);
    let err = deletes.delete(&gate, &session, &dangling).await.unwrap_err();
    assert!(matches!(err, VaultError::MetadataDeleteFailed { .. }));
    h.ledger.fail_deletes(false);

    let patient = Reconciler::new(h.store(), h.ledger(), chrono::Duration::hours(1));
    let report = patient.sweep(session.principal).await.unwrap();
    assert!(report.orphan_objects.is_empty());
    assert_eq!(report.skipped_recent, 1);
    assert_eq!(report.orphan_records.len(), 1);

    let reconciler = Reconciler::new(h.store(), h.ledger(), chrono::Duration::zero());
    let report = reconciler.sweep(session.principal).await.unwrap();
    assert_eq!(report.orphan_objects, vec![orphan.clone()]);
    assert_eq!(report.orphan_records.len(), 1);
    assert_eq!(report.orphan_records[0].id, dangling.id);

    let summary = reconciler.repair(&report).await;
    assert_eq!(summary.objects_removed, 1);
    assert_eq!(summary.records_removed, 1);
    assert!(summary.failures.is_empty());

    assert_eq!(h.store.content_length(&orphan).await.unwrap(), None);
    assert_eq!(
        h.ledger.list_for(session.principal).await.unwrap(),
        vec![kept]
    );
    assert!(
        reconciler
            .sweep(session.principal)
            .await
            .unwrap()
            .is_clean()
    );
}
