pub mod broker;
pub mod channel;
pub mod command;
pub mod policy;
pub mod signal;
pub mod tenant;

pub use broker::*;
pub use channel::*;
pub use command::*;
pub use policy::*;
pub use signal::*;
pub use tenant::*;
