//! Bybit WebSocket client for the live ticker stream
//!
//! Connects to the Bybit V5 public spot endpoint, subscribes to one
//! `tickers.<SYMBOL>` topic and pushes every parsed last price into the
//! feed channel. Reconnects forever with exponential backoff + jitter and
//! a silence watchdog; the process never dies with the transport.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::FeedConfig;
use crate::feed::FeedEvent;

const BASE_BACKOFF_SECS: u64 = 1;
const BACKOFF_JITTER_RATIO: f64 = 0.20;
const WATCHDOG_TICK_SECS: u64 = 5;

fn should_reconnect_due_to_silence(last_useful_message: Instant, silence_secs: u64) -> bool {
    last_useful_message.elapsed().as_secs() >= silence_secs
}

fn backoff_with_jitter_secs(attempt: u32, max_delay_secs: u64) -> u64 {
    let capped_attempt = attempt.min(16);
    let base = BASE_BACKOFF_SECS.saturating_mul(1u64 << capped_attempt);
    let bounded = base.min(max_delay_secs).max(1);

    let jitter = rand::thread_rng()
        .gen_range(1.0 - BACKOFF_JITTER_RATIO..=1.0 + BACKOFF_JITTER_RATIO);
    ((bounded as f64) * jitter)
        .round()
        .clamp(1.0, max_delay_secs as f64) as u64
}

#[derive(Debug, Clone, Serialize)]
struct SubscribeMsg {
    req_id: Option<String>,
    op: String,
    args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TickerMessage {
    topic: Option<String>,
    data: Option<serde_json::Value>,
    success: Option<bool>,
    op: Option<String>,
}

pub struct BybitWsClient {
    cfg: FeedConfig,
}

impl BybitWsClient {
    pub fn new(cfg: FeedConfig) -> Self {
        Self { cfg }
    }

    fn topic(&self) -> String {
        format!("tickers.{}", self.cfg.symbol)
    }

    /// Connect and pump prices until shutdown. Transport failures reconnect;
    /// only shutdown returns.
    pub async fn run(
        self,
        tx: mpsc::Sender<FeedEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        let topic = self.topic();
        let mut reconnect_attempt: u32 = 0;

        loop {
            if *shutdown_rx.borrow() {
                info!(source = %"Bybit", "Feed client shutdown requested");
                return Ok(());
            }

            info!(
                source = %"Bybit",
                url = %self.cfg.ws_url,
                attempt = reconnect_attempt + 1,
                "Connecting to Bybit WebSocket..."
            );

            let (ws_stream, _) = match connect_async(&self.cfg.ws_url).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(source = %"Bybit", error = %e, "Failed to connect");
                    let _ = tx.send(FeedEvent::Error(e.to_string())).await;
                    reconnect_attempt = reconnect_attempt.saturating_add(1);
                    let sleep_secs = backoff_with_jitter_secs(
                        reconnect_attempt,
                        self.cfg.reconnect_max_delay_secs,
                    );
                    warn!(source = %"Bybit", sleep_secs, "Reconnect scheduled");
                    tokio::time::sleep(Duration::from_secs(sleep_secs)).await;
                    continue;
                }
            };

            let (mut write, mut read) = ws_stream.split();

            let sub_msg = SubscribeMsg {
                req_id: Some("sub_1".to_string()),
                op: "subscribe".to_string(),
                args: vec![topic.clone()],
            };
            if let Err(e) = write
                .send(Message::Text(
                    serde_json::to_string(&sub_msg).context("Failed to encode subscribe frame")?,
                ))
                .await
            {
                warn!(source = %"Bybit", error = %e, "Failed to subscribe after connect");
                let _ = tx.send(FeedEvent::Error(e.to_string())).await;
                reconnect_attempt = reconnect_attempt.saturating_add(1);
                let sleep_secs = backoff_with_jitter_secs(
                    reconnect_attempt,
                    self.cfg.reconnect_max_delay_secs,
                );
                tokio::time::sleep(Duration::from_secs(sleep_secs)).await;
                continue;
            }

            info!(source = %"Bybit", topic = %topic, "✅ Connected to Bybit WebSocket");
            reconnect_attempt = 0;
            let _ = tx.send(FeedEvent::Connected).await;

            let mut ping_interval =
                tokio::time::interval(Duration::from_secs(self.cfg.ping_secs));
            ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            let mut watchdog_interval =
                tokio::time::interval(Duration::from_secs(WATCHDOG_TICK_SECS));
            watchdog_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            let mut last_useful_message = Instant::now();
            let reconnect_reason: &'static str = loop {
                tokio::select! {
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match self.handle_message(&text, &tx).await {
                                    Ok(useful) => {
                                        if useful {
                                            last_useful_message = Instant::now();
                                        }
                                    }
                                    Err(e) => {
                                        // Malformed frames are dropped, never fatal
                                        warn!(source = %"Bybit", error = %e, "Failed to parse message");
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                // Bybit expects pong with same payload
                                let _ = write.send(Message::Pong(data)).await;
                            }
                            Some(Ok(Message::Pong(_))) => {
                                last_useful_message = Instant::now();
                            }
                            Some(Ok(Message::Close(_))) => {
                                warn!(source = %"Bybit", "Connection closed by server");
                                break "remote_close";
                            }
                            Some(Err(e)) => {
                                error!(source = %"Bybit", error = %e, "WebSocket error");
                                let _ = tx.send(FeedEvent::Error(e.to_string())).await;
                                break "stream_error";
                            }
                            None => {
                                warn!(source = %"Bybit", "Stream ended");
                                break "stream_ended";
                            }
                            _ => {}
                        }
                    }

                    _ = ping_interval.tick() => {
                        let ping = serde_json::json!({ "op": "ping" });
                        if let Err(e) = write.send(Message::Text(ping.to_string())).await {
                            warn!(source = %"Bybit", error = %e, "Ping failed; reconnecting");
                            break "ping_send_failed";
                        }
                    }

                    _ = watchdog_interval.tick() => {
                        if should_reconnect_due_to_silence(
                            last_useful_message,
                            self.cfg.max_silence_secs,
                        ) {
                            warn!(
                                source = %"Bybit",
                                silence_secs = self.cfg.max_silence_secs,
                                "Watchdog timeout: reconnecting"
                            );
                            let _ = write.send(Message::Close(None)).await;
                            break "watchdog_timeout";
                        }
                    }

                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!(source = %"Bybit", "Shutting down feed client");
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                }
            };

            let _ = tx.send(FeedEvent::Disconnected).await;
            reconnect_attempt = reconnect_attempt.saturating_add(1);
            let sleep_secs =
                backoff_with_jitter_secs(reconnect_attempt, self.cfg.reconnect_max_delay_secs);
            warn!(
                source = %"Bybit",
                reason = reconnect_reason,
                attempt = reconnect_attempt,
                sleep_secs,
                "Reconnect scheduled"
            );
            tokio::time::sleep(Duration::from_secs(sleep_secs)).await;
        }
    }

    /// Returns true when the frame carried a price for our topic.
    async fn handle_message(&self, text: &str, tx: &mpsc::Sender<FeedEvent>) -> Result<bool> {
        let msg: TickerMessage = serde_json::from_str(text)?;

        // Heartbeat response
        if msg.op.as_deref() == Some("pong") || msg.op.as_deref() == Some("ping") {
            return Ok(true);
        }

        // Subscription confirmation
        if msg.success.is_some() {
            debug!(source = %"Bybit", success = ?msg.success, "Subscription response");
            return Ok(false);
        }

        let topic = match msg.topic {
            Some(t) => t,
            None => return Ok(false), // Ignore messages without topic
        };
        if topic != self.topic() {
            return Ok(false);
        }

        let data = match msg.data {
            Some(d) => d,
            None => return Ok(false),
        };

        let last_price = match data.get("lastPrice").and_then(|v| v.as_str()) {
            Some(p) => p,
            None => return Ok(false),
        };

        let price = Decimal::from_str(last_price)
            .with_context(|| format!("Unparsable lastPrice '{}'", last_price))?;

        let _ = tx.send(FeedEvent::Price(price)).await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_cfg() -> FeedConfig {
        FeedConfig {
            ws_url: "wss://stream.bybit.com/v5/public/spot".to_string(),
            rest_url: "https://api.bybit.com".to_string(),
            symbol: "BTCUSDT".to_string(),
            ping_secs: 10,
            max_silence_secs: 20,
            reconnect_max_delay_secs: 60,
        }
    }

    #[test]
    fn backoff_grows_and_caps_at_max_delay() {
        for attempt in 0..32 {
            let secs = backoff_with_jitter_secs(attempt, 60);
            assert!((1..=60).contains(&secs), "attempt {} gave {}s", attempt, secs);
        }
        // Deep attempts must sit at the cap (within jitter)
        let deep = backoff_with_jitter_secs(30, 60);
        assert!(deep >= 48, "expected near-cap backoff, got {}s", deep);
    }

    #[test]
    fn silence_watchdog_triggers_only_after_threshold() {
        let fresh = Instant::now();
        assert!(!should_reconnect_due_to_silence(fresh, 20));
        let stale = Instant::now() - Duration::from_secs(25);
        assert!(should_reconnect_due_to_silence(stale, 20));
    }

    #[tokio::test]
    async fn ticker_frame_for_our_topic_emits_price() {
        let client = BybitWsClient::new(test_cfg());
        let (tx, mut rx) = mpsc::channel(4);

        let frame = r#"{"topic":"tickers.BTCUSDT","type":"snapshot","ts":1,
            "data":{"symbol":"BTCUSDT","lastPrice":"64250.10"}}"#;
        let useful = client.handle_message(frame, &tx).await.unwrap();

        assert!(useful);
        match rx.try_recv().unwrap() {
            FeedEvent::Price(p) => assert_eq!(p, dec!(64250.10)),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn other_topics_are_ignored() {
        let client = BybitWsClient::new(test_cfg());
        let (tx, mut rx) = mpsc::channel(4);

        let frame = r#"{"topic":"tickers.ETHUSDT","data":{"lastPrice":"3000"}}"#;
        let useful = client.handle_message(frame, &tx).await.unwrap();

        assert!(!useful);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscription_ack_is_not_a_price() {
        let client = BybitWsClient::new(test_cfg());
        let (tx, mut rx) = mpsc::channel(4);

        let frame = r#"{"success":true,"op":"subscribe","req_id":"sub_1"}"#;
        let useful = client.handle_message(frame, &tx).await.unwrap();

        assert!(!useful);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn frame_without_last_price_is_dropped() {
        let client = BybitWsClient::new(test_cfg());
        let (tx, mut rx) = mpsc::channel(4);

        let frame = r#"{"topic":"tickers.BTCUSDT","data":{"symbol":"BTCUSDT"}}"#;
        let useful = client.handle_message(frame, &tx).await.unwrap();

        assert!(!useful);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_json_is_an_error_for_the_logger_only() {
        let client = BybitWsClient::new(test_cfg());
        let (tx, _rx) = mpsc::channel(4);

        assert!(client.handle_message("{not json", &tx).await.is_err());
    }
}
