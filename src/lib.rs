pub mod bus;
pub mod cache;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod credentials;
pub mod domain;
pub mod error;
pub mod execution;
pub mod feed;
pub mod idempotency;
pub mod parser;
pub mod pipeline;
pub mod runtime;
pub mod services;
pub mod store;
pub mod telemetry;

pub use bus::{MessageBus, Queue};
pub use cache::{CacheConfig, TenantConfigCache};
pub use config::AppConfig;
pub use coordination::{CircuitBreaker, CircuitState, ShutdownController, ShutdownSignal};
pub use error::{ExecutionError, RelayError, Result};
pub use execution::{BrokerConnector, ConnectorFactory, ExecutionWorker};
pub use feed::{FeedSessionPool, ResilientFeedSession};
pub use idempotency::{GuardedIdempotency, IdempotencyStore};
pub use parser::SignalParser;
pub use pipeline::{Outcome, PipelineWorker};
pub use runtime::Relay;
