//! Transaction Engine Tests
//!
//! Tests the invariants around write and read transactions:
//! - Key uniqueness is enforced in memory and by the store
//! - Updates archive previous versions, newest first, trimmed to the record's
//!   retention count
//! - Admission ceilings fail fast
//! - Deadlocks are retried with backoff, then surfaced
//! - Failed or cancelled bodies leave neither the store nor the mirror changed

mod common;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use common::{add_host, loaded_engine, stored_row, FlakyStore, Host, NS};
use hadb::{
    ConfigValue, Error, HadbObject, IndexFields, LogQuery, LogRecord, TxnMode, TxnOptions,
};

/// Create, read back from memory, update, delete.
#[tokio::test]
async fn object_lifecycle() {
    let (_dir, store) = common::create_temp_store("lifecycle.db");
    let hadb = loaded_engine(store.clone(), common::test_options()).await;

    let created = add_host(&hadb, Host::new("web-1")).await.unwrap();
    assert_eq!(created.ver, 1);
    assert_eq!(created.snapshot_no, 1);
    assert!(created.uid.as_str().starts_with("Host"));

    let mirrored = hadb.get(&created.uid).unwrap().unwrap();
    assert_eq!(mirrored.user_data.name, "web-1");
    assert_eq!(mirrored.keys, IndexFields::new(["web-1"]));

    let uid = created.uid.clone();
    let updated = hadb
        .write(TxnOptions::new(), |txn| {
            let uid = uid.clone();
            async move {
                txn.update_with(&uid, |h| h.notes = "rack 4".to_string())
                    .await
            }
            .boxed()
        })
        .await
        .unwrap();
    assert_eq!(updated.ver, 2);
    assert_eq!(hadb.get(&uid).unwrap().unwrap().user_data.notes, "rack 4");

    let deleted = hadb
        .write(TxnOptions::new(), |txn| {
            let current = updated.clone();
            async move { txn.delete(&current).await }.boxed()
        })
        .await
        .unwrap();
    assert_eq!(deleted.ver, 3);
    assert!(deleted.delete_dt.is_some());

    // Deleted objects leave the indices but stay addressable.
    assert!(hadb
        .search_by_key(&IndexFields::new(["web-1"]), "Host", NS)
        .unwrap()
        .is_none());
    assert!(hadb.get(&uid).unwrap().unwrap().deleted);

    let row = stored_row(&store, &uid).await.unwrap();
    assert!(row.deleted);
    assert_eq!(row.ver, 3);
}

#[tokio::test]
async fn duplicate_key_rejected_in_memory() {
    let (_dir, store) = common::create_temp_store("key_memory.db");
    let hadb = loaded_engine(store, common::test_options()).await;

    add_host(&hadb, Host::new("db-1")).await.unwrap();
    let err = add_host(&hadb, Host::new("  DB-1 ")).await.unwrap_err();
    match err {
        Error::KeyConflict { column, key, .. } => {
            assert_eq!(column, 1);
            assert_eq!(key, "db-1");
        }
        other => panic!("expected key conflict, got {other:?}"),
    }

    // A different namespace is a different key space.
    hadb.write(TxnOptions::new(), |txn| {
        async move { txn.add("other", Host::new("db-1")).await }.boxed()
    })
    .await
    .unwrap();
}

/// A second engine with a stale mirror is stopped by the store's unique index.
#[tokio::test]
async fn duplicate_key_rejected_by_store() {
    let (_dir, store) = common::create_temp_store("key_store.db");
    let a = loaded_engine(store.clone(), common::test_options()).await;
    let b = loaded_engine(store.clone(), common::test_options()).await;

    add_host(&a, Host::new("shared")).await.unwrap();
    assert!(b
        .search_by_key(&IndexFields::new(["shared"]), "Host", NS)
        .unwrap()
        .is_none());

    let err = add_host(&b, Host::new("shared")).await.unwrap_err();
    assert!(matches!(err, Error::KeyConflict { column: 1, .. }), "got {err:?}");
}

/// Within one transaction, a key released by an earlier write can be reused.
#[tokio::test]
async fn key_moves_between_objects_in_one_transaction() {
    let (_dir, store) = common::create_temp_store("key_move.db");
    let hadb = loaded_engine(store, common::test_options()).await;

    let first = add_host(&hadb, Host::new("alpha")).await.unwrap();
    let second = hadb
        .write(TxnOptions::new(), |txn| {
            let first = first.clone();
            async move {
                let mut renamed = first.clone();
                renamed.user_data.name = "alpha-old".to_string();
                txn.update(renamed).await?;
                txn.add(NS, Host::new("alpha")).await
            }
            .boxed()
        })
        .await
        .unwrap();

    let holder = hadb
        .search_by_key(&IndexFields::new(["alpha"]), "Host", NS)
        .unwrap()
        .unwrap();
    assert_eq!(holder.uid, second.uid);
}

#[tokio::test]
async fn archives_keep_newest_versions() {
    let (_dir, store) = common::create_temp_store("archives.db");
    let hadb = loaded_engine(store, common::test_options()).await;

    let created = add_host(&hadb, Host::new("arch")).await.unwrap();
    let uid = created.uid.clone();
    for i in 0..5 {
        hadb.write(TxnOptions::new(), |txn| {
            let uid = uid.clone();
            async move { txn.update_with(&uid, |h| h.hits = i).await }.boxed()
        })
        .await
        .unwrap();
    }

    let archives = hadb
        .read(TxnOptions::new(), |txn| {
            let uid = uid.clone();
            async move { txn.archives(&uid).await }.boxed()
        })
        .await
        .unwrap();

    // Host keeps three archived copies: versions 5, 4, 3.
    let versions: Vec<i64> = archives.iter().map(|a| a.ver).collect();
    assert_eq!(versions, vec![5, 4, 3]);
    assert!(archives.iter().all(|a| a.archive));

    // Archived copies never enter the mirror.
    let current = hadb.get(&uid).unwrap().unwrap();
    assert_eq!(current.ver, 6);
    assert_eq!(hadb.counts().unwrap().values().sum::<usize>(), 1);
}

#[tokio::test]
async fn stale_version_is_a_conflict() {
    let (_dir, store) = common::create_temp_store("stale.db");
    let hadb = loaded_engine(store, common::test_options()).await;

    let created = add_host(&hadb, Host::new("v")).await.unwrap();
    let stale = created.clone();
    hadb.write(TxnOptions::new(), |txn| {
        let obj = created.clone();
        async move { txn.update(obj).await }.boxed()
    })
    .await
    .unwrap();

    let err = hadb
        .write(TxnOptions::new(), |txn| {
            let obj = stale.clone();
            async move { txn.update(obj).await }.boxed()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { expected: 1, actual: 2, .. }), "got {err:?}");
}

#[tokio::test]
async fn failed_body_changes_nothing() {
    let (_dir, store) = common::create_temp_store("abort.db");
    let hadb = loaded_engine(store.clone(), common::test_options()).await;

    let ghost = HadbObject::new(NS, Host::new("ghost"));
    let uid = ghost.uid.clone();
    let err = hadb
        .write(TxnOptions::new(), |txn| {
            let ghost = ghost.clone();
            async move {
                txn.insert(ghost).await?;
                Err::<(), _>(Error::Aborted("changed my mind".to_string()))
            }
            .boxed()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Aborted(_)));

    assert!(hadb.get(&uid).unwrap().is_none());
    assert!(hadb
        .search_by_key(&IndexFields::new(["ghost"]), "Host", NS)
        .unwrap()
        .is_none());
    assert!(stored_row(&store, &uid).await.is_none());
}

#[tokio::test]
async fn write_ceiling_fails_fast() {
    let (_dir, store) = common::create_temp_store("admission.db");
    let hadb = loaded_engine(store, common::test_options()).await;
    hadb.set_config("max_write_txns", ConfigValue::Int(1))
        .await
        .unwrap();

    let held = hadb.begin(TxnMode::Write, TxnOptions::new()).await.unwrap();
    let err = add_host(&hadb, Host::new("blocked")).await.unwrap_err();
    assert!(matches!(err, Error::AdmissionRejected { limit: 1, .. }), "got {err:?}");
    assert!(err.is_retryable());
    assert_eq!(hadb.metrics().admission_rejections, 1);

    // Reads have their own ceiling.
    hadb.read(TxnOptions::new(), |txn| async move { txn.snapshots(1).await }.boxed())
        .await
        .unwrap();

    held.rollback().await.unwrap();
    add_host(&hadb, Host::new("after")).await.unwrap();
}

#[tokio::test]
async fn per_client_ceiling() {
    let (_dir, store) = common::create_temp_store("client.db");
    let hadb = loaded_engine(store, common::test_options()).await;
    hadb.set_config("max_read_txns_per_client", ConfigValue::Int(1))
        .await
        .unwrap();

    let held = hadb
        .begin(TxnMode::Read, TxnOptions::new().client("alice"))
        .await
        .unwrap();
    let err = hadb
        .read(TxnOptions::new().client("alice"), |txn| {
            async move { txn.snapshots(1).await }.boxed()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AdmissionRejected { .. }));

    hadb.read(TxnOptions::new().client("bob"), |txn| {
        async move { txn.snapshots(1).await }.boxed()
    })
    .await
    .unwrap();
    held.commit().await.unwrap();
}

#[tokio::test]
async fn deadlocks_are_retried() {
    let (_dir, store) = common::create_temp_store("deadlock.db");
    let flaky = FlakyStore::new(store);
    let hadb = loaded_engine(flaky.clone(), common::test_options()).await;

    flaky.inject_deadlocks(2);
    let created = add_host(&hadb, Host::new("retry")).await.unwrap();
    assert_eq!(created.ver, 1);
    assert_eq!(flaky.remaining_deadlocks(), 0);
    assert_eq!(hadb.metrics().deadlocks, 2);
}

#[tokio::test]
async fn deadlock_retries_are_bounded() {
    let (_dir, store) = common::create_temp_store("deadlock_bounded.db");
    let flaky = FlakyStore::new(store);
    let hadb = loaded_engine(flaky.clone(), common::test_options()).await;
    hadb.set_config("deadlock_retry_count", ConfigValue::Int(2))
        .await
        .unwrap();

    flaky.inject_deadlocks(10);
    let err = add_host(&hadb, Host::new("doomed")).await.unwrap_err();
    match err {
        Error::Deadlock { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected deadlock, got {other:?}"),
    }
    assert_eq!(flaky.remaining_deadlocks(), 7);
}

#[tokio::test]
async fn cancelled_transaction_is_not_merged() {
    let (_dir, store) = common::create_temp_store("cancel.db");
    let hadb = loaded_engine(store.clone(), common::test_options()).await;

    let token = CancellationToken::new();
    let trigger = token.clone();
    let err = hadb
        .write(TxnOptions::new().cancel_on(token), |txn| {
            let trigger = trigger.clone();
            async move {
                txn.add(NS, Host::new("cancelled")).await?;
                trigger.cancel();
                futures::future::pending::<()>().await;
                Ok(())
            }
            .boxed()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(hadb
        .search_by_key(&IndexFields::new(["cancelled"]), "Host", NS)
        .unwrap()
        .is_none());

    // The connection went back to the pool and the write lock is free.
    add_host(&hadb, Host::new("cancelled")).await.unwrap();
}

#[tokio::test]
async fn nested_body_joins_outer_transaction() {
    let (_dir, store) = common::create_temp_store("nested.db");
    let hadb = loaded_engine(store, common::test_options()).await;

    let mut outer = hadb.begin(TxnMode::Write, TxnOptions::new()).await.unwrap();
    let inner = hadb
        .write_in(Some(&mut outer), TxnOptions::new(), |txn| {
            async move { txn.add(NS, Host::new("inner")).await }.boxed()
        })
        .await
        .unwrap();
    assert_eq!(inner.snapshot_no, outer.snapshot_no());

    // Nothing is visible before the outer transaction commits.
    assert!(hadb.get(&inner.uid).unwrap().is_none());
    outer.commit().await.unwrap();
    assert!(hadb.get(&inner.uid).unwrap().is_some());

    // Without an outer transaction a fresh one is opened.
    hadb.write_in(None, TxnOptions::new(), |txn| {
        async move { txn.add(NS, Host::new("standalone")).await }.boxed()
    })
    .await
    .unwrap();

    // Nesting into a read transaction is refused.
    let mut reader = hadb.begin(TxnMode::Read, TxnOptions::new()).await.unwrap();
    let err = hadb
        .write_in(Some(&mut reader), TxnOptions::new(), |txn| {
            async move { txn.add(NS, Host::new("nope")).await }.boxed()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadOnly(_)));
}

/// The caller swallows a nested failure; the outer commit must still refuse.
#[tokio::test]
async fn failed_nested_body_aborts_outer_transaction() {
    let (_dir, store) = common::create_temp_store("nested_abort.db");
    let hadb = loaded_engine(store.clone(), common::test_options()).await;
    add_host(&hadb, Host::new("taken")).await.unwrap();

    let mut outer = hadb.begin(TxnMode::Write, TxnOptions::new()).await.unwrap();
    let first = outer.add(NS, Host::new("first")).await.unwrap();
    let err = hadb
        .write_in(Some(&mut outer), TxnOptions::new(), |txn| {
            async move { txn.add(NS, Host::new("taken")).await }.boxed()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::KeyConflict { .. }));

    let err = outer.commit().await.unwrap_err();
    assert!(matches!(err, Error::Aborted(_)));
    assert!(hadb.get(&first.uid).unwrap().is_none());
    assert!(stored_row(&store, &first.uid).await.is_none());
}

#[tokio::test]
async fn snapshots_are_cut_on_demand() {
    let (_dir, store) = common::create_temp_store("snapshots.db");
    let hadb = loaded_engine(store, common::test_options()).await;

    let first = add_host(&hadb, Host::new("s1")).await.unwrap();
    assert_eq!(first.snapshot_no, 1);
    let second = add_host(&hadb, Host::new("s2")).await.unwrap();
    assert_eq!(second.snapshot_no, 1);

    assert_eq!(hadb.take_snapshot().await.unwrap(), 2);
    let third = add_host(&hadb, Host::new("s3")).await.unwrap();
    assert_eq!(third.snapshot_no, 2);

    let snapshots = hadb
        .read(TxnOptions::new(), |txn| async move { txn.snapshots(0).await }.boxed())
        .await
        .unwrap();
    let numbers: Vec<i64> = snapshots.iter().map(|s| s.number).collect();
    assert_eq!(numbers, vec![2, 1]);
    assert_eq!(snapshots[0].description, "requested");
}

#[tokio::test]
async fn logs_and_quota() {
    let (_dir, store) = common::create_temp_store("logs.db");
    let hadb = loaded_engine(store, common::test_options()).await;

    hadb.write(TxnOptions::new(), |txn| {
        async move {
            for i in 0..3 {
                txn.append_log(
                    LogRecord::new(NS, "login", format!("user logged in #{i}"))
                        .with_labels(IndexFields::new(["alice"])),
                )
                .await?;
            }
            txn.append_log(LogRecord::new(NS, "login", "bob logged in").with_labels(IndexFields::new(["bob"])))
                .await?;
            Ok(())
        }
        .boxed()
    })
    .await
    .unwrap();

    let alice = LogQuery {
        kind: Some("login".to_string()),
        labels: IndexFields::new(["alice"]),
        ..LogQuery::default()
    };
    let (logs, within, over) = hadb
        .read(TxnOptions::new(), |txn| {
            let alice = alice.clone();
            async move {
                let logs = txn.query_logs(&alice).await?;
                let within = txn.check_log_quota(&alice, 5).await;
                let over = txn.check_log_quota(&alice, 3).await;
                Ok((logs, within, over))
            }
            .boxed()
        })
        .await
        .unwrap();

    assert_eq!(logs.len(), 3);
    assert!(logs[0].id > logs[1].id, "newest first");
    assert!(logs.iter().all(|l| l.snapshot_no == 1));
    assert_eq!(within.unwrap(), 3);
    assert!(matches!(over, Err(Error::QuotaExceeded(_))));

    let text = LogQuery {
        text: Some("BOB".to_string()),
        ..LogQuery::default()
    };
    let bob = hadb
        .read(TxnOptions::new(), |txn| {
            let text = text.clone();
            async move { txn.query_logs(&text).await }.boxed()
        })
        .await
        .unwrap();
    assert_eq!(bob.len(), 1);
}

#[tokio::test]
async fn quick_lookup_rows() {
    let (_dir, store) = common::create_temp_store("quick.db");
    let hadb = loaded_engine(store, common::test_options()).await;

    hadb.write(TxnOptions::new(), |txn| {
        async move { txn.quick_set("session:1", b"token".to_vec()).await }.boxed()
    })
    .await
    .unwrap();

    let (entry, removed, gone) = hadb
        .write(TxnOptions::new(), |txn| {
            async move {
                let entry = txn.quick_get("session:1").await?;
                let removed = txn.quick_delete("session:1").await?;
                let gone = txn.quick_get("session:1").await?;
                Ok((entry, removed, gone))
            }
            .boxed()
        })
        .await
        .unwrap();
    assert_eq!(entry.unwrap().value, b"token".to_vec());
    assert!(removed);
    assert!(gone.is_none());

    let err = hadb
        .read(TxnOptions::new(), |txn| {
            async move { txn.quick_set("k", Vec::new()).await }.boxed()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadOnly(_)));
}
