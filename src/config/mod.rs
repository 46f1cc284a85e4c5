//! Configuration management for CoinRace
//!
//! Loads from optional config files + environment variables via .env

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub game: GameConfig,
    pub feed: FeedConfig,
    pub chain: ChainConfig,
    pub persistence: PersistenceConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameConfig {
    /// Betting window length in seconds
    pub bet_secs: u64,
    /// Racing window length in seconds
    pub racing_secs: u64,
    /// Cool-down after settlement in seconds
    pub cooldown_secs: u64,
    /// Track length in render units; caps total travel per race
    pub track_length: f64,
    /// Ambient forward motion added to both tracks per frame
    pub ambient_step: f64,
    /// Ambient motion frame interval in milliseconds
    pub frame_interval_ms: u64,
    /// House margin retained from the losing pool (fraction)
    pub margin: f64,
    /// Minimum rendered lead of the winning track at settlement
    pub lead_margin: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Bybit V5 public spot WebSocket endpoint
    pub ws_url: String,
    /// Bybit V5 REST endpoint, used once at startup to seed the price
    pub rest_url: String,
    /// Instrument symbol (e.g. "BTCUSDT")
    pub symbol: String,
    /// Application-level ping interval in seconds
    pub ping_secs: u64,
    /// Reconnect if no frame arrives for this many seconds
    pub max_silence_secs: u64,
    /// Ceiling on the reconnect backoff delay in seconds
    pub reconnect_max_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// JSON-RPC endpoint
    pub rpc_url: String,
    /// Expected `net_version` of the endpoint
    pub network_id: String,
    /// Game contract address (bets pay into it, payouts credit from it)
    pub contract_address: String,
    /// Blocks on top of the funding tx before a bet counts as confirmed
    pub confirmations: u64,
    /// Mempool poll interval in milliseconds
    pub mempool_poll_ms: u64,
    /// Give up looking for the tx in the mempool after this many seconds
    pub mempool_timeout_secs: u64,
    /// Head-block poll interval during the confirmation wait, milliseconds
    pub confirm_poll_ms: u64,
    /// Overall deadline for one verification in seconds
    pub verify_deadline_secs: u64,
    /// Winners per payout transaction
    pub payout_batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory for round/bet CSV files
    pub data_dir: String,
    /// Page size for the round history query
    pub history_page_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Cookie carrying the session token
    pub cookie_name: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Game defaults
            .set_default("game.bet_secs", 12)?
            .set_default("game.racing_secs", 15)?
            .set_default("game.cooldown_secs", 5)?
            .set_default("game.track_length", 290.0)?
            .set_default("game.ambient_step", 0.15)?
            .set_default("game.frame_interval_ms", 100)?
            .set_default("game.margin", 0.05)?
            .set_default("game.lead_margin", 20.0)?
            // Feed defaults
            .set_default("feed.ws_url", "wss://stream.bybit.com/v5/public/spot")?
            .set_default("feed.rest_url", "https://api.bybit.com")?
            .set_default("feed.symbol", "BTCUSDT")?
            .set_default("feed.ping_secs", 10)?
            .set_default("feed.max_silence_secs", 20)?
            .set_default("feed.reconnect_max_delay_secs", 60)?
            // Chain defaults
            .set_default("chain.rpc_url", "http://localhost:8545")?
            .set_default("chain.network_id", "10143")?
            .set_default("chain.contract_address", "")?
            .set_default("chain.confirmations", 12)?
            .set_default("chain.mempool_poll_ms", 200)?
            .set_default("chain.mempool_timeout_secs", 5)?
            .set_default("chain.confirm_poll_ms", 400)?
            .set_default("chain.verify_deadline_secs", 120)?
            .set_default("chain.payout_batch_size", 200)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.history_page_size", 10)?
            // Session defaults
            .set_default("session.cookie_name", "session")?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (COINRACE_*)
            .add_source(Environment::with_prefix("COINRACE").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "v={} symbol={} bet={}s race={}s cooldown={}s margin={:.2} network={}",
            env!("CARGO_PKG_VERSION"),
            self.feed.symbol,
            self.game.bet_secs,
            self.game.racing_secs,
            self.game.cooldown_secs,
            self.game.margin,
            self.chain.network_id,
        )
    }

    /// Validate required environment variables and address material
    pub fn validate_env(&self) -> Result<()> {
        let required = vec!["PRIVATE_KEY", "SESSION_SECRET"];

        for var in required {
            if std::env::var(var).is_err() {
                bail!("Required environment variable {} is not set", var);
            }
        }

        // Validate private key format
        let pk = std::env::var("PRIVATE_KEY")?;
        if !pk.starts_with("0x") || pk.len() != 66 {
            bail!("PRIVATE_KEY must be a hex string with 0x prefix (66 chars total)");
        }

        // Payouts credit balances on this contract; a bad address means no
        // round can ever settle, so refuse to start.
        let addr = &self.chain.contract_address;
        if !addr.starts_with("0x")
            || addr.len() != 42
            || !addr[2..].chars().all(|c| c.is_ascii_hexdigit())
        {
            bail!("chain.contract_address must be a 0x-prefixed 20-byte hex address");
        }

        Ok(())
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
