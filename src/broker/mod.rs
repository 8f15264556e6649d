//! Broker adapter trait and implementations (spec.md §6 "Broker adapter
//! (consumed interface)").
//!
//! The execution router only ever talks to a `BrokerAdapter`; the concrete
//! IG-style REST adapter and the in-memory simulator used by tests and the
//! backtest engine are interchangeable behind it, a thin trait boundary
//! between consumers and any concrete transport.

mod ig;
mod sim;

pub use ig::IgBrokerAdapter;
pub use sim::SimBrokerAdapter;

use crate::error::BrokerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DealStatus {
    Accepted,
    Rejected,
    #[default]
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub deal_reference: String,
    pub deal_id: Option<String>,
    #[serde(skip)]
    pub deal_status: Option<DealStatus>,
    pub status_raw: String,
    pub rejection_reason: Option<String>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSummary {
    pub account_id: String,
    pub account_type: String,
    pub balance: f64,
    pub available: f64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub deal_id: String,
    pub epic: String,
    pub direction: Direction,
    pub size: f64,
    pub entry_level: f64,
    pub stop_level: Option<f64>,
    pub limit_level: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingOrder {
    pub deal_id: String,
    pub epic: String,
    pub direction: Direction,
    pub size: f64,
    pub level: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDetails {
    pub epic: String,
    pub bid: Option<f64>,
    pub offer: Option<f64>,
    pub tradeable: bool,
    pub min_deal_size: f64,
}

/// Consumed interface the execution router depends on. All methods may fail
/// with `BrokerError`; implementations retry transient/rate-limited errors
/// with backoff internally rather than pushing retry policy onto callers.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn verify_session(&self) -> Result<(), BrokerError>;
    async fn list_accounts(&self) -> Result<Vec<AccountSummary>, BrokerError>;
    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    #[allow(clippy::too_many_arguments)]
    async fn place_market_order(
        &self,
        epic: &str,
        direction: Direction,
        size: f64,
        stop_level: Option<f64>,
        limit_level: Option<f64>,
        deal_reference: &str,
    ) -> Result<OrderAck, BrokerError>;

    async fn close_position(
        &self,
        deal_id: &str,
        direction: Direction,
        size: f64,
    ) -> Result<OrderAck, BrokerError>;

    async fn get_working_orders(&self) -> Result<Vec<WorkingOrder>, BrokerError>;
    async fn cancel_working_order(&self, deal_id: &str) -> Result<(), BrokerError>;
    async fn get_market_details(&self, epic: &str) -> Result<MarketDetails, BrokerError>;
}
