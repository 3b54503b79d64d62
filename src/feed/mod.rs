//! Tenant feed connectivity
//!
//! One [`ResilientFeedSession`] per tenant, owned by the [`FeedSessionPool`].
//! Sessions talk to the outside world through a [`FeedTransport`]; the
//! WebSocket gateway is the production transport and the loopback hub is
//! used for local runs and tests.

pub mod control;
pub mod loopback;
pub mod pool;
pub mod session;
pub mod transport;
pub mod websocket;

pub use control::ChannelControl;
pub use loopback::{AuthMode, LoopbackHub, LoopbackTransport};
pub use pool::{FeedSessionPool, PoolConfig};
pub use session::{ResilientFeedSession, SessionContext, SESSION_FILE};
pub use transport::{ConnectionState, EventSender, FeedConnector, FeedTransport, TransportEvent};
pub use websocket::{WebSocketConfig, WebSocketConnector, WebSocketTransport};
