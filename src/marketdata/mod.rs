//! Market-data subsystem (spec.md §4.16-§4.18): stream/poll connection
//! management, tick-to-bar aggregation, and outbound throttling so
//! downstream consumers see a steady, bounded flow of updates.

pub mod bar_builder;
pub mod controller;
pub mod publisher;
pub mod ws_throttle;

pub use bar_builder::{BarBuilder, Tick};
pub use controller::{BackoffPolicy, ControllerState, FeedMode, MarketDataController};
pub use publisher::{Quote, QuotePublisher};
pub use ws_throttle::{EventCategory, OutboundEvent, WsThrottler};
