//! Streaming session engine
//!
//! A [`Session`] owns one stream's lifecycle: state machine, bounded
//! history, the set of live listeners and aggregate stats. Protocol
//! runtimes publish into it; any number of subscribers read from it.

pub mod context;
pub mod error;
pub mod event;
pub mod listener;
pub mod manager;
pub mod ring;
pub mod session;

pub use context::{ContextError, StreamContext};
pub use error::StreamError;
pub use event::{Direction, Event, Kind, Opcode, ProtocolMeta, SseMeta, WsMeta};
pub use listener::{DropPolicy, SubscribeOptions, Subscription};
pub use manager::{Completion, Manager, SessionInfo};
pub use ring::RingBuffer;
pub use session::{Session, SessionOptions, State, Stats, SubscribeSnapshot};
