//! Live execution path: trading gates, risk engine, order registry, safety
//! net and the router that ties them to a `BrokerAdapter` (spec.md §4.8-§4.14).

pub mod gates;
pub mod kill_switch;
pub mod ledger;
pub mod registry;
pub mod risk_engine;
pub mod router;
pub mod safety_guard;

pub use gates::{AccountVerification, GateCheckInput, GateDecision, TradingGates, UiConfirmation};
pub use kill_switch::{CloseAttemptOutcome, KillSwitch, KillSwitchStatus};
pub use ledger::{ExecutionLedger, LedgerEntry, LedgerManifest, PositionSnapshotRow};
pub use registry::{OrderRegistry, RegistryError};
pub use risk_engine::{RiskCheckInput, RiskDecision, RiskEngine, RiskLimits};
pub use router::{AllowlistCheck, AlwaysAllowed, ExecutionRouter, RouteOutcome, RouteRequest, RouterDependencies};
pub use safety_guard::{validate_demo_size, CircuitBreaker, CircuitState, IdempotencyGuard};
