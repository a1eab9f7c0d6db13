//! Fast Update Tests
//!
//! Tests the lazy update path:
//! - Keys and labels are immutable on the fast path
//! - "No change" leaves the object and the pending set alone
//! - The per-object quota returns the current value instead of mutating
//! - Flushes are conditional: a transaction that wrote a newer version wins
//! - Pending updates survive full reloads, failed flushes and dispose
//! - Fast updates racing a full reload are never lost

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use common::{add_host, loaded_engine, stored_row, FlakyStore, Host};
use hadb::{EngineOptions, Error, FastUpdateQuota, HadbObject, SqliteStore, TxnOptions, Uid};

async fn stored_host(store: &SqliteStore, uid: &Uid) -> HadbObject<Host> {
    let row = stored_row(store, uid).await.expect("row exists");
    HadbObject::from_stored(&row).expect("decode row")
}

fn bump(h: &mut Host) -> bool {
    h.hits += 1;
    true
}

#[tokio::test]
async fn indexed_fields_are_immutable() {
    let (_dir, store) = common::create_temp_store("immutable.db");
    let hadb = loaded_engine(store, common::test_options()).await;
    let created = add_host(&hadb, Host::new("fixed")).await.unwrap();

    let err = hadb
        .fast_update(&created.uid, |h| {
            h.name = "renamed".into();
            true
        })
        .unwrap_err();
    assert!(matches!(err, Error::IndexFieldMutated { .. }));

    let err = hadb
        .fast_update(&created.uid, |h| {
            h.zone = "ap".into();
            h.hits = 5;
            true
        })
        .unwrap_err();
    assert!(matches!(err, Error::IndexFieldMutated { .. }));

    let current = hadb.get(&created.uid).unwrap().unwrap();
    assert_eq!(current.user_data, created.user_data);
    assert_eq!(current.update_dt, created.update_dt);
    assert_eq!(hadb.metrics().pending_fast_updates, 0);

    // Free text outside keys and labels may change.
    hadb.fast_update(&created.uid, |h| {
        h.notes = "patched".into();
        true
    })
    .unwrap();
    assert_eq!(hadb.metrics().pending_fast_updates, 1);
}

#[tokio::test]
async fn no_change_returns_current_object() {
    let (_dir, store) = common::create_temp_store("no_change.db");
    let hadb = loaded_engine(store, common::test_options()).await;
    let created = add_host(&hadb, Host::new("idle")).await.unwrap();
    let current = hadb.get(&created.uid).unwrap().unwrap();

    let declined = hadb.fast_update(&created.uid, |_| false).unwrap();
    assert!(Arc::ptr_eq(&declined, &current));

    // Reports a change but leaves the payload identical.
    let same = hadb
        .fast_update(&created.uid, |h| {
            h.hits = 0;
            true
        })
        .unwrap();
    assert!(Arc::ptr_eq(&same, &current));

    assert_eq!(hadb.metrics().pending_fast_updates, 0);
    assert_eq!(hadb.metrics().fast_updates, 0);
}

#[tokio::test]
async fn unknown_or_deleted_objects_are_not_found() {
    let (_dir, store) = common::create_temp_store("missing.db");
    let hadb = loaded_engine(store, common::test_options()).await;

    let err = hadb.fast_update(&Uid::new("Host-none"), bump).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let created = add_host(&hadb, Host::new("gone")).await.unwrap();
    hadb.write(TxnOptions::new(), |txn| {
        let obj = created.clone();
        async move { txn.delete(&obj).await }.boxed()
    })
    .await
    .unwrap();
    let err = hadb.fast_update(&created.uid, bump).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn quota_returns_current_value() {
    let (_dir, store) = common::create_temp_store("quota.db");
    let options = EngineOptions {
        fast_update_quota: Some(FastUpdateQuota {
            max_updates: 2,
            per: Duration::from_secs(60),
        }),
        ..common::test_options()
    };
    let hadb = loaded_engine(store, options).await;
    let created = add_host(&hadb, Host::new("chatty")).await.unwrap();

    hadb.fast_update(&created.uid, bump).unwrap();
    hadb.fast_update(&created.uid, bump).unwrap();
    let throttled = hadb.fast_update(&created.uid, bump).unwrap();

    assert_eq!(throttled.user_data.hits, 2);
    let metrics = hadb.metrics();
    assert_eq!(metrics.fast_updates, 2);
    assert_eq!(metrics.fast_updates_throttled, 1);
}

#[tokio::test]
async fn quota_window_slides() {
    let (_dir, store) = common::create_temp_store("quota_window.db");
    let options = EngineOptions {
        fast_update_quota: Some(FastUpdateQuota {
            max_updates: 1,
            per: Duration::from_millis(50),
        }),
        ..common::test_options()
    };
    let hadb = loaded_engine(store, options).await;
    let created = add_host(&hadb, Host::new("bursty")).await.unwrap();

    hadb.fast_update(&created.uid, bump).unwrap();
    assert_eq!(hadb.fast_update(&created.uid, bump).unwrap().user_data.hits, 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(hadb.fast_update(&created.uid, bump).unwrap().user_data.hits, 2);
}

#[tokio::test]
async fn flush_writes_without_new_version() {
    let (_dir, store) = common::create_temp_store("flush.db");
    let hadb = loaded_engine(store.clone(), common::test_options()).await;

    let mut uids = Vec::new();
    for i in 0..10 {
        uids.push(add_host(&hadb, Host::new(&format!("h{i}"))).await.unwrap().uid);
    }
    for uid in &uids {
        hadb.fast_update(uid, bump).unwrap();
        hadb.fast_update(uid, bump).unwrap();
    }
    assert_eq!(hadb.metrics().pending_fast_updates, 10);

    // Parallel lanes may contend on the single SQLite writer; failed entries
    // stay pending for the next pass.
    for _ in 0..5 {
        if hadb.metrics().pending_fast_updates == 0 {
            break;
        }
        hadb.flush_now().await.unwrap();
    }
    assert_eq!(hadb.metrics().pending_fast_updates, 0);
    assert_eq!(hadb.metrics().flushed, 10);

    for uid in &uids {
        let stored = stored_host(&store, uid).await;
        assert_eq!(stored.user_data.hits, 2);
        assert_eq!(stored.ver, 1);
        assert_eq!(stored.update_dt, hadb.get(uid).unwrap().unwrap().update_dt);
    }
}

/// Engine B writes a new version; A's pending change is dropped, not forced.
#[tokio::test]
async fn transaction_supersedes_pending_update() {
    let (_dir, store) = common::create_temp_store("supersede.db");
    let a = loaded_engine(store.clone(), common::test_options()).await;
    let created = add_host(&a, Host::new("contested")).await.unwrap();
    let b = loaded_engine(store.clone(), common::test_options()).await;

    a.fast_update(&created.uid, bump).unwrap();
    b.write(TxnOptions::new(), |txn| {
        let uid = created.uid.clone();
        async move { txn.update_with(&uid, |h| h.notes = "owned by b".into()).await }.boxed()
    })
    .await
    .unwrap();

    let report = a.flush_now().await.unwrap();
    assert_eq!(report.superseded, 1);
    assert_eq!(report.flushed, 0);
    assert_eq!(a.metrics().pending_fast_updates, 0);

    let stored = stored_host(&store, &created.uid).await;
    assert_eq!(stored.ver, 2);
    assert_eq!(stored.user_data.hits, 0);
    assert_eq!(stored.user_data.notes, "owned by b");

    a.reload_now(false).await.unwrap();
    assert_eq!(a.get(&created.uid).unwrap().unwrap().ver, 2);
}

/// A local transaction replaces the pending object in the mirror, so the
/// flush finds nothing older to overwrite.
#[tokio::test]
async fn local_transaction_supersedes_pending_update() {
    let (_dir, store) = common::create_temp_store("supersede_local.db");
    let hadb = loaded_engine(store.clone(), common::test_options()).await;
    let created = add_host(&hadb, Host::new("local")).await.unwrap();

    hadb.fast_update(&created.uid, bump).unwrap();
    let updated = hadb
        .write(TxnOptions::new(), |txn| {
            let uid = created.uid.clone();
            async move { txn.update_with(&uid, |h| h.notes = "txn".into()).await }.boxed()
        })
        .await
        .unwrap();
    assert_eq!(hadb.get(&created.uid).unwrap().unwrap().ver, updated.ver);

    let report = hadb.flush_now().await.unwrap();
    assert_eq!(report.superseded, 1);
    assert_eq!(stored_host(&store, &created.uid).await.user_data.notes, "txn");
}

#[tokio::test]
async fn full_reload_keeps_pending_updates() {
    let (_dir, store) = common::create_temp_store("reload_pending.db");
    let hadb = loaded_engine(store.clone(), common::test_options()).await;
    let created = add_host(&hadb, Host::new("sticky")).await.unwrap();

    hadb.fast_update(&created.uid, |h| {
        h.hits = 7;
        true
    })
    .unwrap();
    hadb.reload_now(true).await.unwrap();

    assert_eq!(hadb.get(&created.uid).unwrap().unwrap().user_data.hits, 7);
    assert_eq!(hadb.metrics().pending_fast_updates, 1);

    // The queue points at the new data set's cell.
    hadb.fast_update(&created.uid, bump).unwrap();
    let report = hadb.flush_now().await.unwrap();
    assert_eq!(report.flushed, 1);
    assert_eq!(stored_host(&store, &created.uid).await.user_data.hits, 8);
}

#[tokio::test]
async fn failed_flush_stays_pending() {
    let (_dir, store) = common::create_temp_store("flush_offline.db");
    let flaky = FlakyStore::new(store.clone());
    let hadb = loaded_engine(flaky.clone(), common::test_options()).await;
    let created = add_host(&hadb, Host::new("patient")).await.unwrap();

    hadb.fast_update(&created.uid, bump).unwrap();
    flaky.set_offline(true);
    let report = hadb.flush_now().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(hadb.metrics().pending_fast_updates, 1);
    assert_eq!(hadb.metrics().flush_failures, 1);

    flaky.set_offline(false);
    let report = hadb.flush_now().await.unwrap();
    assert_eq!(report.flushed, 1);
    assert_eq!(stored_host(&store, &created.uid).await.user_data.hits, 1);
}

#[tokio::test]
async fn dispose_flushes_pending_updates() {
    let (_dir, store) = common::create_temp_store("dispose.db");
    let hadb = loaded_engine(store.clone(), common::test_options()).await;
    let created = add_host(&hadb, Host::new("last")).await.unwrap();

    hadb.fast_update(&created.uid, |h| {
        h.notes = "written on shutdown".into();
        true
    })
    .unwrap();
    hadb.dispose().await;

    let stored = stored_host(&store, &created.uid).await;
    assert_eq!(stored.user_data.notes, "written on shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_fast_updates_are_serialized_per_object() {
    let (_dir, store) = common::create_temp_store("concurrent.db");
    let hadb = loaded_engine(store.clone(), common::test_options()).await;
    let created = add_host(&hadb, Host::new("counter")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let hadb = hadb.clone();
        let uid = created.uid.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..25 {
                hadb.fast_update(&uid, bump).unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let current = hadb.get(&created.uid).unwrap().unwrap();
    assert_eq!(current.user_data.hits, 200);
    assert_eq!(current.ver, 1);

    hadb.flush_now().await.unwrap();
    assert_eq!(stored_host(&store, &created.uid).await.user_data.hits, 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fast_updates_survive_concurrent_full_reloads() {
    let (_dir, store) = common::create_temp_store("fast_reload_race.db");
    let hadb = loaded_engine(store.clone(), common::test_options()).await;
    let created = add_host(&hadb, Host::new("racing")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let hadb = hadb.clone();
        let uid = created.uid.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..50 {
                hadb.fast_update(&uid, bump).unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    let mut reloads = 0;
    while reloads < 5 || handles.iter().any(|h| !h.is_finished()) {
        hadb.reload_now(true).await.unwrap();
        reloads += 1;
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Every increment lands in the installed data set, whichever side of a
    // hand-over it ran on.
    assert_eq!(hadb.get(&created.uid).unwrap().unwrap().user_data.hits, 200);
    assert_eq!(hadb.metrics().pending_fast_updates, 1);

    let report = hadb.flush_now().await.unwrap();
    assert_eq!(report.flushed, 1);
    assert_eq!(hadb.metrics().pending_fast_updates, 0);
    assert_eq!(stored_host(&store, &created.uid).await.user_data.hits, 200);
}
