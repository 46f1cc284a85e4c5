//! CoinRace Library
//!
//! Round engine for the on-chain crypto price race

pub mod broadcast;
pub mod chain;
pub mod config;
pub mod feed;
pub mod game;
pub mod identity;
pub mod ledger;
pub mod types;
