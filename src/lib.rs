//! Live case updates for Let's-ParaConnect.
//!
//! Case, message and invitation handlers publish named events for a case;
//! every client watching that case over a server-sent events connection
//! receives them. Events are broadcast once and never stored.

pub mod broadcaster;
pub mod config;
pub mod error;
pub mod event;
pub mod server;
pub mod sse;
pub mod subscriber;

pub use broadcaster::{Broadcaster, Limits, Unsubscribe};
pub use error::{CaseEventsError, ConfigError, WriteError};
pub use event::{CaseId, EventKind};
pub use subscriber::{ChannelSubscriber, Subscriber};
