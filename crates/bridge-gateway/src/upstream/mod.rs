//! Upstream TCP side of the bridge

mod backoff;
mod codec;
mod link;

pub use backoff::Backoff;
pub use codec::{LineCodec, DEFAULT_MAX_LINE_LENGTH};
pub use link::{LinkState, LinkStats, SendOutcome, UpstreamError, UpstreamLink};
