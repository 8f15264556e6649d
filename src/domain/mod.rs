//! Core domain value types shared by the backtest and live-execution paths.

pub mod bar;
pub mod order;
pub mod position;
pub mod signal;

pub use bar::{Bar, BarValidationError, Timeframe};
pub use order::{IllegalTransition, OrderIntent, OrderStatus, OrderTracker, OrderType, Side};
pub use position::{EquityPoint, ExitReason, Position, TradeRecord};
pub use signal::{Direction, PositionSide, SignalIntent};
