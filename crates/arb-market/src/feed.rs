//! Streaming market-data ingestion.
//!
//! Maintains a single logical WebSocket connection to the upstream
//! order-book endpoint. The ingestor is the sole writer to the
//! [`BookStore`]: it deduplicates messages, enforces per-token sequence
//! admission, and requests snapshot reseeds when it observes a gap.
//!
//! Resilience:
//! - reconnect with exponential backoff (initial 1s, x2, capped 30s)
//! - resubscription of all tokens after reconnect
//! - LRU message deduplication (>= 10k keys)
//! - sequence-gap detection with snapshot reseed (next snapshot overwrites)

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

use arb_common::{OrderLevel, Side, TokenId};

use crate::book::BookError;
use crate::store::BookStore;

/// Errors from the feed ingestor.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("connection timeout")]
    Timeout,

    #[error("stream ended unexpectedly")]
    StreamEnded,

    /// Book-level invariant violation. Not locally recoverable.
    #[error(transparent)]
    Book(#[from] BookError),
}

/// Configuration for the feed ingestor.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// WebSocket endpoint URL.
    pub url: String,
    /// Initial reconnect backoff.
    pub backoff_initial: Duration,
    /// Backoff cap.
    pub backoff_max: Duration,
    /// Dedup LRU capacity.
    pub dedup_lru_size: usize,
    /// Connect timeout.
    pub connect_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "wss://ws-subscriptions-clob.example.com/ws/market".to_string(),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            dedup_lru_size: 10_000,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// One price level on the wire. Prices and sizes travel as strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireOrderLevel {
    pub price: String,
    pub size: String,
}

/// One delta entry on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelUpdate {
    pub side: String,
    pub price: String,
    pub size: String,
}

/// Inbound wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    BookSnapshot {
        token_id: String,
        #[serde(default)]
        msg_id: String,
        bids: Vec<WireOrderLevel>,
        asks: Vec<WireOrderLevel>,
        seq: u64,
        /// Milliseconds since epoch.
        ts: i64,
    },
    BookDelta {
        token_id: String,
        #[serde(default)]
        msg_id: String,
        updates: Vec<LevelUpdate>,
        seq: u64,
        ts: i64,
    },
}

/// Event emitted by the ingestor for telemetry attribution.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// A message was accepted and applied to the store.
    Received {
        token_id: TokenId,
        seq: u64,
        received_at: Instant,
    },
    /// A delta arrived with seq > last + 1.
    SequenceGap {
        token_id: TokenId,
        expected: u64,
        got: u64,
    },
    /// A duplicate or out-of-order message was dropped.
    Dropped { token_id: TokenId, seq: u64 },
    /// The ingestor asked upstream to resend a snapshot.
    SnapshotRequested { token_id: TokenId },
    /// Connection established (initial or reconnect).
    Connected,
    /// Connection lost.
    Disconnected,
}

/// Connection and admission statistics.
#[derive(Debug, Default)]
pub struct FeedStats {
    pub connects: AtomicU64,
    pub disconnects: AtomicU64,
    pub messages: AtomicU64,
    pub duplicates: AtomicU64,
    pub out_of_order: AtomicU64,
    pub sequence_gaps: AtomicU64,
    pub decode_errors: AtomicU64,
}

impl FeedStats {
    pub fn snapshot(&self) -> FeedStatsSnapshot {
        FeedStatsSnapshot {
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            sequence_gaps: self.sequence_gaps.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`FeedStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStatsSnapshot {
    pub connects: u64,
    pub disconnects: u64,
    pub messages: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub sequence_gaps: u64,
    pub decode_errors: u64,
}

/// LRU set for message deduplication.
///
/// Keys are 64-bit keccak prefixes of (msg_id, seq). Eviction is lazy:
/// stale queue entries whose stamp no longer matches are skipped.
struct DedupCache {
    entries: HashMap<u64, u64>,
    queue: VecDeque<(u64, u64)>,
    capacity: usize,
    stamp: u64,
}

impl DedupCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            queue: VecDeque::with_capacity(capacity),
            capacity: capacity.max(16),
            stamp: 0,
        }
    }

    /// Returns true if the key was new.
    fn insert(&mut self, key: u64) -> bool {
        self.stamp += 1;
        let fresh = self.entries.insert(key, self.stamp).is_none();
        self.queue.push_back((key, self.stamp));
        while self.entries.len() > self.capacity {
            match self.queue.pop_front() {
                Some((k, s)) => {
                    if self.entries.get(&k) == Some(&s) {
                        self.entries.remove(&k);
                    }
                }
                None => break,
            }
        }
        fresh
    }
}

/// Outcome of handling a single message.
#[derive(Debug, PartialEq, Eq)]
enum Admission {
    Applied,
    Dropped,
    /// Delta gap: the token needs a snapshot reseed.
    Reseed(TokenId),
}

/// WebSocket feed ingestor. Sole writer to the [`BookStore`].
pub struct FeedIngestor {
    config: FeedConfig,
    store: Arc<BookStore>,
    subscriptions: Vec<TokenId>,
    dedup: Mutex<DedupCache>,
    stats: Arc<FeedStats>,
    events: Option<mpsc::Sender<FeedEvent>>,
}

impl FeedIngestor {
    pub fn new(
        config: FeedConfig,
        store: Arc<BookStore>,
        subscriptions: Vec<TokenId>,
        events: Option<mpsc::Sender<FeedEvent>>,
    ) -> Self {
        let dedup = Mutex::new(DedupCache::new(config.dedup_lru_size));
        Self {
            config,
            store,
            subscriptions,
            dedup,
            stats: Arc::new(FeedStats::default()),
            events,
        }
    }

    pub fn stats(&self) -> Arc<FeedStats> {
        Arc::clone(&self.stats)
    }

    /// Run the ingest loop until shutdown. Reconnects with exponential
    /// backoff on any session error.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), FeedError> {
        let mut backoff = self.config.backoff_initial;

        loop {
            if shutdown.try_recv().is_ok() {
                info!("feed ingestor: shutdown signal received");
                return Ok(());
            }

            match self.run_session(&mut shutdown).await {
                Ok(()) => {
                    info!("feed ingestor: clean shutdown");
                    return Ok(());
                }
                Err(e) => {
                    self.stats.disconnects.fetch_add(1, Ordering::Relaxed);
                    self.emit(FeedEvent::Disconnected);
                    warn!("feed connection error: {e}, reconnecting in {backoff:?}");

                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.recv() => {
                            info!("feed ingestor: shutdown during reconnect");
                            return Ok(());
                        }
                    }
                    backoff = (backoff * 2).min(self.config.backoff_max);
                }
            }
        }
    }

    /// One WebSocket session: connect, subscribe all tokens, then pump
    /// messages until error or shutdown.
    async fn run_session(&self, shutdown: &mut broadcast::Receiver<()>) -> Result<(), FeedError> {
        info!("connecting to market feed at {}", self.config.url);

        let connect_result = tokio::time::timeout(
            self.config.connect_timeout,
            connect_async(self.config.url.as_str()),
        )
        .await;

        let (ws_stream, _) = match connect_result {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => return Err(FeedError::Connection(e.to_string())),
            Err(_) => return Err(FeedError::Timeout),
        };

        self.stats.connects.fetch_add(1, Ordering::Relaxed);
        self.emit(FeedEvent::Connected);
        info!("market feed connected");

        let (mut write, mut read) = ws_stream.split();

        // Resubscribe everything; the server answers each subscription
        // with a fresh snapshot, which overwrites any stale state.
        let subscribe = subscription_message(&self.subscriptions);
        write
            .send(Message::Text(subscribe.into()))
            .await
            .map_err(|e| FeedError::WebSocket(e.to_string()))?;
        info!("subscribed {} tokens", self.subscriptions.len());

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let received_at = Instant::now();
                            match self.handle_text(&text, received_at) {
                                Ok(Admission::Reseed(token)) => {
                                    let req = subscription_message(std::slice::from_ref(&token));
                                    write.send(Message::Text(req.into())).await
                                        .map_err(|e| FeedError::WebSocket(e.to_string()))?;
                                    self.emit(FeedEvent::SnapshotRequested { token_id: token });
                                }
                                Ok(_) => {}
                                Err(e @ FeedError::Book(_)) => return Err(e),
                                Err(e) => debug!("feed message skipped: {e}"),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await
                                .map_err(|e| FeedError::WebSocket(e.to_string()))?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            warn!("feed close frame: {frame:?}");
                            return Err(FeedError::StreamEnded);
                        }
                        Some(Err(e)) => return Err(FeedError::WebSocket(e.to_string())),
                        None => return Err(FeedError::StreamEnded),
                        _ => {}
                    }
                }
                _ = shutdown.recv() => {
                    info!("feed session: shutdown");
                    return Ok(());
                }
            }
        }
    }

    /// Decode and admit one message. Exposed at crate level so the
    /// admission pipeline is testable without a socket.
    fn handle_text(&self, text: &str, received_at: Instant) -> Result<Admission, FeedError> {
        self.stats.messages.fetch_add(1, Ordering::Relaxed);

        let msg: WireMessage = serde_json::from_str(text).map_err(|e| {
            self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            FeedError::Decode(e.to_string())
        })?;
        self.admit(msg, received_at)
    }

    fn admit(&self, msg: WireMessage, received_at: Instant) -> Result<Admission, FeedError> {
        match msg {
            WireMessage::BookSnapshot {
                token_id,
                msg_id,
                bids,
                asks,
                seq,
                ts,
            } => {
                let token = TokenId::from(token_id);
                if !self.dedup_admit(&msg_id, &token, seq) {
                    return Ok(Admission::Dropped);
                }
                // Snapshots overwrite unconditionally: they are the reseed
                // mechanism, so no gap check applies.
                let bids = parse_levels(&bids)?;
                let asks = parse_levels(&asks)?;
                self.store
                    .apply_snapshot(&token, bids, asks, seq, parse_ts(ts), received_at)?;
                self.emit(FeedEvent::Received {
                    token_id: token,
                    seq,
                    received_at,
                });
                Ok(Admission::Applied)
            }
            WireMessage::BookDelta {
                token_id,
                msg_id,
                updates,
                seq,
                ts,
            } => {
                let token = TokenId::from(token_id);
                if !self.dedup_admit(&msg_id, &token, seq) {
                    return Ok(Admission::Dropped);
                }

                let last = self.store.last_seq(&token);
                match last {
                    // Delta before any snapshot: nothing to apply to.
                    None => {
                        self.emit(FeedEvent::Dropped {
                            token_id: token.clone(),
                            seq,
                        });
                        Ok(Admission::Reseed(token))
                    }
                    Some(last) if seq <= last => {
                        self.stats.out_of_order.fetch_add(1, Ordering::Relaxed);
                        self.emit(FeedEvent::Dropped {
                            token_id: token,
                            seq,
                        });
                        Ok(Admission::Dropped)
                    }
                    Some(last) if seq > last + 1 => {
                        self.stats.sequence_gaps.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "sequence gap on {token}: expected {}, got {seq}; reseeding",
                            last + 1
                        );
                        self.store.mark_stale(&token);
                        self.emit(FeedEvent::SequenceGap {
                            token_id: token.clone(),
                            expected: last + 1,
                            got: seq,
                        });
                        Ok(Admission::Reseed(token))
                    }
                    Some(_) => {
                        let parsed = parse_updates(&updates)?;
                        self.store
                            .apply_delta(&token, &parsed, seq, parse_ts(ts), received_at)?;
                        self.emit(FeedEvent::Received {
                            token_id: token,
                            seq,
                            received_at,
                        });
                        Ok(Admission::Applied)
                    }
                }
            }
        }
    }

    /// Returns true if the message is new; counts and reports duplicates.
    fn dedup_admit(&self, msg_id: &str, token: &TokenId, seq: u64) -> bool {
        let key = dedup_key(msg_id, token.as_str(), seq);
        let fresh = self.dedup.lock().expect("dedup lock poisoned").insert(key);
        if !fresh {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            self.emit(FeedEvent::Dropped {
                token_id: token.clone(),
                seq,
            });
        }
        fresh
    }

    fn emit(&self, event: FeedEvent) {
        if let Some(tx) = &self.events {
            // Telemetry must never block ingestion.
            let _ = tx.try_send(event);
        }
    }
}

fn subscription_message(tokens: &[TokenId]) -> String {
    let ids: Vec<&str> = tokens.iter().map(|t| t.as_str()).collect();
    serde_json::json!({
        "action": "subscribe",
        "token_ids": ids,
    })
    .to_string()
}

fn dedup_key(msg_id: &str, token_id: &str, seq: u64) -> u64 {
    let mut hasher = Keccak256::new();
    hasher.update(msg_id.as_bytes());
    hasher.update(token_id.as_bytes());
    hasher.update(seq.to_le_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("keccak digest is 32 bytes"))
}

fn parse_ts(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn parse_decimal(s: &str) -> Result<Decimal, FeedError> {
    s.parse::<Decimal>()
        .map_err(|e| FeedError::Decode(format!("bad decimal {s:?}: {e}")))
}

fn parse_levels(raw: &[WireOrderLevel]) -> Result<Vec<OrderLevel>, FeedError> {
    raw.iter()
        .map(|l| Ok(OrderLevel::new(parse_decimal(&l.price)?, parse_decimal(&l.size)?)))
        .collect()
}

fn parse_updates(raw: &[LevelUpdate]) -> Result<Vec<(Side, OrderLevel)>, FeedError> {
    raw.iter()
        .map(|u| {
            let side = match u.side.to_lowercase().as_str() {
                "buy" | "bid" => Side::Buy,
                "sell" | "ask" => Side::Sell,
                other => return Err(FeedError::Decode(format!("unknown side {other:?}"))),
            };
            Ok((side, OrderLevel::new(parse_decimal(&u.price)?, parse_decimal(&u.size)?)))
        })
        .collect()
}
