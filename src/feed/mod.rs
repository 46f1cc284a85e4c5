//! Live price feed
//!
//! A single long-lived pump task owns the exchange stream client, drops
//! repeated identical prices and fans fresh ticks out. Consumers hold a
//! cheap [`PriceFeed`] handle: `current_price()` for the latest sample,
//! `subscribe()` for a tick stream. The pump outlives every round; rounds
//! come and go while the stream stays up.

pub mod bybit;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::broadcast::Broadcaster;
use crate::config::FeedConfig;
use crate::feed::bybit::BybitWsClient;
use crate::types::PricePoint;

const TICK_CHANNEL_CAPACITY: usize = 512;
const WARMUP_HTTP_TIMEOUT_SECS: u64 = 10;

/// Raw events from the stream client, before dedup
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Price(Decimal),
    Connected,
    Disconnected,
    Error(String),
}

/// Read handle onto the feed. Cloneable, cheap, never blocks the pump.
#[derive(Clone)]
pub struct PriceFeed {
    latest_rx: watch::Receiver<Option<PricePoint>>,
    ticks_tx: broadcast::Sender<PricePoint>,
}

impl PriceFeed {
    /// Build the handle/pump pair. The caller runs the pump on its own task.
    pub fn new(cfg: FeedConfig, broadcaster: Broadcaster) -> (Self, FeedPump) {
        let (latest_tx, latest_rx) = watch::channel(None);
        let (ticks_tx, _) = broadcast::channel(TICK_CHANNEL_CAPACITY);

        let feed = Self {
            latest_rx,
            ticks_tx: ticks_tx.clone(),
        };
        let pump = FeedPump {
            cfg,
            broadcaster,
            latest_tx,
            ticks_tx,
        };
        (feed, pump)
    }

    /// Latest sample seen, if any arrived yet
    pub fn current_price(&self) -> Option<PricePoint> {
        *self.latest_rx.borrow()
    }

    /// Fresh tick stream starting from the next price change. Drop the
    /// handle to unsubscribe.
    pub fn subscribe(&self) -> PriceStream {
        PriceStream {
            inner: BroadcastStream::new(self.ticks_tx.subscribe()),
        }
    }
}

/// A subscription onto the tick fan-out
pub struct PriceStream {
    inner: BroadcastStream<PricePoint>,
}

impl PriceStream {
    /// Next fresh price, or `None` once the feed shut down. A slow consumer
    /// skips the ticks it missed instead of stalling the pump.
    pub async fn next_tick(&mut self) -> Option<PricePoint> {
        while let Some(item) = self.inner.next().await {
            match item {
                Ok(point) => return Some(point),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Price subscriber lagged; resuming at live edge");
                    continue;
                }
            }
        }
        None
    }
}

/// Owns the stream client and publishes into the fan-out
pub struct FeedPump {
    cfg: FeedConfig,
    broadcaster: Broadcaster,
    latest_tx: watch::Sender<Option<PricePoint>>,
    ticks_tx: broadcast::Sender<PricePoint>,
}

impl FeedPump {
    /// Seed the latest price over REST so the first round does not have to
    /// wait for the stream to deliver a tick.
    pub async fn warmup(&self) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(WARMUP_HTTP_TIMEOUT_SECS))
            .build()
            .context("Failed to build warmup HTTP client")?;

        let url = format!(
            "{}/v5/market/tickers?category=spot&symbol={}",
            self.cfg.rest_url, self.cfg.symbol
        );
        info!(url = %url, "Fetching warmup ticker");

        let resp = client
            .get(&url)
            .send()
            .await
            .context("Warmup request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("Warmup request returned HTTP {}", resp.status());
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .context("Warmup response was not JSON")?;
        let ret_code = body.get("retCode").and_then(|v| v.as_i64()).unwrap_or(-1);
        if ret_code != 0 {
            let ret_msg = body
                .get("retMsg")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            anyhow::bail!("Warmup rejected: retCode={} retMsg={}", ret_code, ret_msg);
        }

        let last_price = body
            .pointer("/result/list/0/lastPrice")
            .and_then(|v| v.as_str())
            .context("Warmup response had no lastPrice")?;
        let price = Decimal::from_str(last_price)
            .with_context(|| format!("Unparsable warmup lastPrice '{}'", last_price))?;

        info!(symbol = %self.cfg.symbol, price = %price, "✅ Warmup price loaded");
        self.publish(price);
        Ok(())
    }

    /// Run until shutdown. The stream client reconnects on its own; this
    /// loop only consumes its events.
    pub async fn run(self, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let (event_tx, mut event_rx) = mpsc::channel::<FeedEvent>(256);
        let client = BybitWsClient::new(self.cfg.clone());
        let mut client_task = tokio::spawn(client.run(event_tx, shutdown_rx.clone()));

        let mut shutdown_rx = shutdown_rx;
        loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(FeedEvent::Price(price)) => self.publish(price),
                    Some(FeedEvent::Connected) => {
                        info!(symbol = %self.cfg.symbol, "Price feed connected");
                    }
                    Some(FeedEvent::Disconnected) => {
                        warn!("Price feed disconnected; reconnect in progress");
                    }
                    Some(FeedEvent::Error(e)) => {
                        warn!(error = %e, "Price feed error");
                    }
                    None => break,
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        // The client watches the same shutdown signal; don't wait out a
        // backoff sleep if it is mid-reconnect.
        if tokio::time::timeout(Duration::from_secs(5), &mut client_task)
            .await
            .is_err()
        {
            client_task.abort();
        }
        info!("Price feed pump stopped");
        Ok(())
    }

    /// Store and fan out a price, skipping exchange re-sends of the same
    /// value. Public so a source other than the stream client can drive
    /// the same fan-out.
    pub fn publish(&self, price: Decimal) {
        let unchanged = self
            .latest_tx
            .borrow()
            .map(|p| p.price == price)
            .unwrap_or(false);
        if unchanged {
            return;
        }

        let point = PricePoint::now(price);
        let _ = self.latest_tx.send(Some(point));
        // Ignore send errors (no receivers is fine)
        let _ = self.ticks_tx.send(point);
        self.broadcaster.new_price(price);
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

    #[tokio::test]
    async fn current_price_tracks_last_published() {
        let (feed, pump) = PriceFeed::new(test_cfg(), Broadcaster::default());
        assert!(feed.current_price().is_none());

        pump.publish(dec!(64000));
        pump.publish(dec!(64001.5));

        let latest = feed.current_price().unwrap();
        assert_eq!(latest.price, dec!(64001.5));
    }

    #[tokio::test]
    async fn repeated_prices_do_not_tick() {
        let (feed, pump) = PriceFeed::new(test_cfg(), Broadcaster::default());
        let mut stream = feed.subscribe();

        pump.publish(dec!(64000));
        pump.publish(dec!(64000));
        pump.publish(dec!(64000));
        pump.publish(dec!(63999.9));

        assert_eq!(stream.next_tick().await.unwrap().price, dec!(64000));
        assert_eq!(stream.next_tick().await.unwrap().price, dec!(63999.9));
        drop(pump);
        assert!(stream.next_tick().await.is_none());
    }

    #[tokio::test]
    async fn subscribers_only_see_ticks_after_joining() {
        let (feed, pump) = PriceFeed::new(test_cfg(), Broadcaster::default());

        pump.publish(dec!(100));
        let mut stream = feed.subscribe();
        pump.publish(dec!(101));

        assert_eq!(stream.next_tick().await.unwrap().price, dec!(101));
    }

    #[tokio::test]
    async fn every_fresh_price_reaches_the_event_bus() {
        let broadcaster = Broadcaster::new(16);
        let mut events = broadcaster.subscribe();
        let (_feed, pump) = PriceFeed::new(test_cfg(), broadcaster);

        pump.publish(dec!(250.10));
        pump.publish(dec!(250.10));

        let envelope = events.recv().await.unwrap();
        match envelope.event {
            crate::broadcast::GameEvent::NewPrice(p) => assert_eq!(p, dec!(250.10)),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }
}
