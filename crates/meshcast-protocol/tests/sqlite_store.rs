//! SQLite store against a real file: state must survive reopening.
use meshcast_protocol::{
    HistoryFilter, HistoryQuery, KnownPeer, Message, MessageStore, NodeAddress, OutboxEntry,
    SqliteStore, Target,
};

fn addr(s: &str) -> NodeAddress {
    s.parse().unwrap()
}

fn msg(id: &str, ts: u64, target: Target) -> Message {
    Message {
        id: id.into(),
        sender_address: addr("n-a"),
        sender_name: "ana".into(),
        body: id.as_bytes().to_vec(),
        created_at: ts,
        target,
        hop_budget: 16,
    }
}

#[tokio::test]
async fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node.db");

    {
        let store = SqliteStore::open(&path).unwrap();
        for (i, ts) in [10u64, 20, 30].iter().enumerate() {
            store
                .append(&msg(&format!("m{i}"), *ts, Target::Broadcast))
                .await
                .unwrap();
        }
        store
            .enqueue_outbox(&OutboxEntry {
                message: msg("pending", 40, Target::Node(addr("n-b"))),
                enqueued_at: 40,
            })
            .await
            .unwrap();
        store
            .save_peer(&KnownPeer {
                address: addr("n-b"),
                display_name: "bo".into(),
                last_seen_at: 5,
            })
            .await
            .unwrap();
        store.save_setting("self_address", "n-a").await.unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    let all = store.query_by_time(&HistoryQuery::latest(10)).await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(store.list_outbox().await.unwrap()[0].message.id, "pending");
    assert_eq!(store.load_peers().await.unwrap()[0].display_name, "bo");
    assert_eq!(
        store.load_setting("self_address").await.unwrap().as_deref(),
        Some("n-a")
    );
}

/// Delta-sync completeness: exactly the messages after the cursor, capped,
/// ascending.
#[tokio::test]
async fn after_query_is_exact_subset() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("sync.db")).unwrap();
    for ts in 1..=20u64 {
        store
            .append(&msg(&format!("m{ts:02}"), ts * 10, Target::Broadcast))
            .await
            .unwrap();
    }
    store
        .append(&msg("private", 205, Target::Node(addr("n-z"))))
        .await
        .unwrap();

    let got = store
        .query_by_time(
            &HistoryQuery::after(100, 5).with_filter(HistoryFilter::VisibleTo(addr("n-b"))),
        )
        .await
        .unwrap();
    let stamps: Vec<u64> = got.iter().map(|m| m.created_at).collect();
    assert_eq!(stamps, vec![110, 120, 130, 140, 150]);

    let tail = store
        .query_by_time(
            &HistoryQuery::after(180, 100).with_filter(HistoryFilter::VisibleTo(addr("n-b"))),
        )
        .await
        .unwrap();
    let ids: Vec<&str> = tail.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m19", "m20"]);
}

#[tokio::test]
async fn out_of_range_timestamp_is_refused_not_wrapped() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("range.db")).unwrap();
    let err = store
        .append(&msg("huge", u64::MAX - 5, Target::Broadcast))
        .await
        .unwrap_err();
    assert!(matches!(err, meshcast_protocol::MeshError::Storage(_)));

    let top = i64::MAX as u64;
    assert!(store.append(&msg("top", top, Target::Broadcast)).await.unwrap());
    let after = store.query_by_time(&HistoryQuery::after(1000, 100)).await.unwrap();
    let stamps: Vec<u64> = after.iter().map(|m| m.created_at).collect();
    assert_eq!(stamps, vec![top]);
    let latest = store.query_by_time(&HistoryQuery::latest(10)).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].id, "top");
}
