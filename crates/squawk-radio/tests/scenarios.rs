//! Multi-client scenarios over a shared in-memory store.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use squawk_common::StoreError;
use squawk_radio::arbitration::{Arbiter, ClaimResult};
use squawk_radio::playback::ManualClock;
use squawk_radio::{RadioConfig, RadioEvent, Session, SessionStreams, TxStatus};
use squawk_store::{
    AppendEvent, CoordinationStore, DisconnectAction, MemoryStore, TxnDecision, TxnOutcome,
};

async fn login(store: &MemoryStore, name: &str) -> (Session, SessionStreams) {
    let config = RadioConfig {
        namespace: "ns".into(),
        ..RadioConfig::default()
    };
    Session::login(
        Arc::new(store.clone()),
        config,
        name,
        "",
        Arc::new(ManualClock::new()),
    )
    .await
    .unwrap()
}

/// Delegating store that delays every transaction, so a stop request can
/// overtake an in-flight claim deterministically.
struct SlowStore {
    inner: MemoryStore,
    txn_delay: Duration,
}

#[async_trait]
impl CoordinationStore for SlowStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(path).await
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.inner.set(path, value).await
    }

    async fn update(&self, path: &str, patch: Value) -> Result<(), StoreError> {
        self.inner.update(path, patch).await
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.inner.remove(path).await
    }

    async fn transaction(
        &self,
        path: &str,
        f: &(dyn for<'a> Fn(Option<&'a Value>) -> TxnDecision + Send + Sync),
    ) -> Result<TxnOutcome, StoreError> {
        tokio::time::sleep(self.txn_delay).await;
        self.inner.transaction(path, f).await
    }

    async fn append(&self, path: &str, value: Value) -> Result<String, StoreError> {
        self.inner.append(path, value).await
    }

    async fn watch(&self, path: &str) -> mpsc::Receiver<Option<Value>> {
        self.inner.watch(path).await
    }

    async fn watch_appends(&self, path: &str) -> mpsc::Receiver<AppendEvent> {
        self.inner.watch_appends(path).await
    }

    async fn register_disconnect(
        &self,
        path: &str,
        action: DisconnectAction,
    ) -> Result<(), StoreError> {
        self.inner.register_disconnect(path, action).await
    }

    async fn cancel_disconnect(&self, path: &str) -> Result<(), StoreError> {
        self.inner.cancel_disconnect(path).await
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.inner.connectivity()
    }
}

#[tokio::test]
async fn concurrent_claims_grant_exactly_one() {
    let store = MemoryStore::new();

    let mut handles = Vec::new();
    for i in 0..5 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let arbiter = Arbiter::new(
                Arc::new(store),
                "ns".into(),
                format!("u{i}"),
                format!("UNIT-{i}"),
                Arc::new(AtomicBool::new(true)),
            );
            arbiter.claim("main").await.unwrap()
        }));
    }

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap() == ClaimResult::Granted {
            granted += 1;
        }
    }
    assert_eq!(granted, 1);

    let claim = store
        .get("ns/channels/main/activeSpeaker")
        .await
        .unwrap()
        .unwrap();
    assert!(claim["userId"].as_str().unwrap().starts_with('u'));
}

#[tokio::test(start_paused = true)]
async fn stop_during_claim_leaves_no_orphaned_slot() {
    let store = SlowStore {
        inner: MemoryStore::new(),
        txn_delay: Duration::from_millis(100),
    };
    let inner = store.inner.clone();
    let arbiter = Arc::new(Arbiter::new(
        Arc::new(store),
        "ns".into(),
        "a".into(),
        "ALPHA".into(),
        Arc::new(AtomicBool::new(true)),
    ));

    let claimer = Arc::clone(&arbiter);
    let claim = tokio::spawn(async move { claimer.claim("main").await.unwrap() });

    // Let the claim reach its delayed transaction, then stop.
    tokio::time::sleep(Duration::from_millis(10)).await;
    arbiter.release().await.unwrap();

    assert_eq!(claim.await.unwrap(), ClaimResult::Aborted);
    assert!(arbiter.is_idle().await);
    // The committed slot was released immediately; nothing dangles.
    assert!(inner
        .get("ns/channels/main/activeSpeaker")
        .await
        .unwrap()
        .is_none());
}

/// The full push-to-talk exchange: A transmits while B is refused, B
/// receives gapless audio, and after A releases B takes the channel.
#[tokio::test(start_paused = true)]
async fn ptt_exchange_between_two_clients() {
    let store = MemoryStore::new();
    let (alpha, _alpha_streams) = login(&store, "ALPHA").await;
    let (bravo, mut bravo_streams) = login(&store, "BRAVO").await;

    let handle = alpha.begin_transmit("main").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(bravo.begin_transmit("main").await.unwrap().is_none());

    // Three 200 ms blocks across three flush intervals.
    for _ in 0..3 {
        handle.push_block(&[0.25; 3200], 16_000);
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut starts = Vec::new();
    for _ in 0..3 {
        let buffer = bravo_streams.audio.recv().await.unwrap();
        assert_eq!(buffer.samples.len(), 3200);
        starts.push(buffer.start);
    }
    // Gapless: each buffer starts where the previous ended (0.2 s apart
    // at 16 kHz), with no overlap and no repeats.
    for pair in starts.windows(2) {
        assert!((pair[1] - pair[0] - 0.2).abs() < 1e-9);
    }

    alpha.end_transmit().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(bravo.begin_transmit("main").await.unwrap().is_some());

    alpha.logout().await.unwrap();
    bravo.logout().await.unwrap();
}

/// A stop racing a fresh grant must never leave the capture pipeline
/// flushing to a channel the client no longer owns.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_racing_a_grant_never_leaves_capture_running() {
    for _ in 0..10 {
        let store = MemoryStore::new();
        let config = RadioConfig {
            namespace: "ns".into(),
            chunk_interval_ms: 20,
            ..RadioConfig::default()
        };
        let (session, _streams) = Session::login(
            Arc::new(store.clone()),
            config,
            "ALPHA",
            "",
            Arc::new(ManualClock::new()),
        )
        .await
        .unwrap();
        let session = Arc::new(session);

        let begin = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.begin_transmit("main").await.unwrap() })
        };
        let end = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.end_transmit().await.unwrap() })
        };
        let handle = begin.await.unwrap();
        end.await.unwrap();
        // If the grant outlived the racing stop, settle it now.
        session.end_transmit().await.unwrap();

        store.remove("ns/channels/main/audioStream").await.unwrap();
        if let Some(handle) = handle {
            handle.push_block(&[0.5; 320], 16_000);
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let leftover: Vec<_> = store
            .dump()
            .await
            .into_keys()
            .filter(|k| k.starts_with("ns/channels/main/audioStream/"))
            .collect();
        assert!(leftover.is_empty(), "capture still flushing after stop");
        session.logout().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn late_joiner_skips_stale_audio() {
    let store = MemoryStore::new();
    let (alpha, _alpha_streams) = login(&store, "ALPHA").await;

    let handle = alpha.begin_transmit("main").await.unwrap().unwrap();
    handle.push_block(&[0.25; 3200], 16_000);
    tokio::time::sleep(Duration::from_millis(250)).await;

    // Bravo joins mid-transmission: the chunk already in the log is
    // backlog and must not play.
    let (bravo, mut bravo_streams) = login(&store, "BRAVO").await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(bravo_streams.audio.try_recv().is_err());

    // A chunk appended after the join does play.
    handle.push_block(&[0.25; 3200], 16_000);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(bravo_streams.audio.recv().await.unwrap().samples.len(), 3200);

    alpha.logout().await.unwrap();
    bravo.logout().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn channel_activity_reaches_other_clients() {
    let store = MemoryStore::new();
    let (alpha, _alpha_streams) = login(&store, "ALPHA").await;
    let (_bravo, mut bravo_streams) = login(&store, "BRAVO").await;

    alpha.begin_transmit("channel2").await.unwrap().unwrap();
    loop {
        match bravo_streams.events.recv().await.unwrap() {
            RadioEvent::ChannelActivity { channel, speaker: Some(claim) } => {
                assert_eq!(channel, "channel2");
                assert_eq!(claim.display_name, "ALPHA");
                break;
            }
            _ => continue,
        }
    }
    loop {
        match bravo_streams.events.recv().await.unwrap() {
            RadioEvent::Status(TxStatus::Receiving { channel, from }) => {
                assert_eq!(channel, "channel2");
                assert_eq!(from, "ALPHA");
                break;
            }
            _ => continue,
        }
    }

    alpha.end_transmit().await.unwrap();
    loop {
        match bravo_streams.events.recv().await.unwrap() {
            RadioEvent::ChannelActivity { speaker: None, .. } => break,
            _ => continue,
        }
    }
    alpha.logout().await.unwrap();
}

#[tokio::test]
async fn reconnect_reasserts_presence_for_each_cycle() {
    let store = MemoryStore::new();
    let (session, mut streams) = login(&store, "ALPHA").await;
    let uid = session.user_id().to_string();
    let path = format!("ns/users/{uid}");

    for _ in 0..2 {
        store.set_connected(false).await;
        loop {
            if matches!(streams.events.recv().await.unwrap(), RadioEvent::Reconnecting) {
                break;
            }
        }
        let v = store.get(&path).await.unwrap().unwrap();
        assert_eq!(v["online"], serde_json::json!(false));

        store.set_connected(true).await;
        loop {
            if matches!(streams.events.recv().await.unwrap(), RadioEvent::Reconnected) {
                break;
            }
        }
        let v = store.get(&path).await.unwrap().unwrap();
        assert_eq!(v["online"], serde_json::json!(true));
    }

    session.logout().await.unwrap();
}

#[tokio::test]
async fn message_reply_round_trip_between_sessions() {
    let store = MemoryStore::new();
    let (alpha, mut alpha_streams) = login(&store, "ALPHA").await;
    let (bravo, mut bravo_streams) = login(&store, "BRAVO").await;

    let key = alpha
        .send_message("crew to channel 2")
        .await
        .unwrap()
        .unwrap();

    let incoming_key = loop {
        match bravo_streams.events.recv().await.unwrap() {
            RadioEvent::Message(squawk_radio::MessageEvent::New { key, message }) => {
                assert_eq!(message.text, "crew to channel 2");
                break key;
            }
            _ => continue,
        }
    };
    assert_eq!(incoming_key, key);

    bravo.reply_message(&key, "copy").await.unwrap();
    loop {
        match alpha_streams.events.recv().await.unwrap() {
            RadioEvent::Message(squawk_radio::MessageEvent::Replied { message, .. }) => {
                assert_eq!(message.reply.as_deref(), Some("copy"));
                assert_eq!(message.reply_from.as_deref(), Some("BRAVO"));
                break;
            }
            _ => continue,
        }
    }

    alpha.logout().await.unwrap();
    bravo.logout().await.unwrap();
}
