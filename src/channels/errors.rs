//! Error types shared by every channel variant.

use miette::Diagnostic;
use thiserror::Error;

/// Errors raised by channel reads and updates.
///
/// Channels are value-oriented containers rebuilt from the last checkpoint
/// each superstep; both error variants therefore carry the channel name so
/// scheduler-level diagnostics can point at the offending rendezvous.
#[derive(Debug, Clone, Error, Diagnostic, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel has never been written (or its barrier has not tripped).
    #[error("channel `{channel}` is empty")]
    #[diagnostic(
        code(stepgraph::channels::empty),
        help("Read `{channel}` only after a node has written it or its barrier condition is met.")
    )]
    EmptyChannel { channel: String },

    /// The channel rejected a grouped write.
    #[error("invalid update for channel `{channel}`: {reason}")]
    #[diagnostic(code(stepgraph::channels::invalid_update))]
    InvalidUpdate { channel: String, reason: String },
}

impl ChannelError {
    /// Shorthand for [`ChannelError::EmptyChannel`].
    pub fn empty(channel: impl Into<String>) -> Self {
        ChannelError::EmptyChannel {
            channel: channel.into(),
        }
    }

    /// Shorthand for [`ChannelError::InvalidUpdate`].
    pub fn invalid_update(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        ChannelError::InvalidUpdate {
            channel: channel.into(),
            reason: reason.into(),
        }
    }
}
