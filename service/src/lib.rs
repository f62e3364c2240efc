//! Bank Service
//!
//! Account, user and transfer operations on top of the ledger engine:
//! request validation, existence and currency checks, deadlines and
//! counters. Transport and credentials live outside this crate.

pub mod config;
pub mod metrics;
pub mod service;
pub mod validation;

pub use config::{LogFormat, PoolConfig, ServiceConfig};
pub use metrics::{ActiveTransfer, MetricsSnapshot, ServiceMetrics, SharedMetrics};
pub use service::{BankService, NewUser, Page, TransferCommand};
