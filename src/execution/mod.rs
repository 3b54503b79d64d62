//! Broker execution
//!
//! The [`ConnectorFactory`] turns a broker connection id into a validated
//! [`BrokerConnector`]; the [`ExecutionWorker`] consumes trade commands and
//! settles each one through its connector.

pub mod connector;
pub mod factory;
pub mod ig;
pub mod paper;
pub mod worker;

pub use connector::{
    await_confirmation, BrokerConnector, Confirmation, ConnectorProvider, DealStatus,
    ExecutionReport, ExecutionState, SymbolMap,
};
pub use factory::{ConnectorEquity, ConnectorFactory};
pub use ig::{IgConfig, IgConnector, IgProvider};
pub use paper::{PaperConnector, PaperProvider};
pub use worker::ExecutionWorker;
