//! Control-plane delivery: framing, transports, buffering and the event
//! stream itself.

pub mod buffer;
pub mod codec;
pub mod event_stream;
pub mod transport;

pub use buffer::{EventBuffer, PushOutcome};
pub use event_stream::{EventStream, EventStreamOptions, StreamHealth};
pub use transport::{BoxedStream, TcpTransport, Transport};
