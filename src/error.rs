use thiserror::Error;

/// Errors surfaced by queue handles and the manager dispatcher.
///
/// Mode violations (`clear` or a non-blocking dequeue on a fast-mode queue)
/// are not represented here: those warn and no-op rather than fail, so that
/// a polling script keeps running.
#[derive(Debug, Error)]
pub enum QueueError {
    /// An integer-shaped wire field failed to parse.
    #[error("queue: {op}: {what} is not an integer")]
    NotAnInteger {
        op: &'static str,
        what: &'static str,
    },

    /// A dequeue was asked for fewer than one item.
    #[error("queue: {op}: count must be a positive integer")]
    BadCount { op: &'static str },

    /// `await` on a queue constructed without the await channel.
    #[error("queue: await: queue was not constructed with await enabled")]
    AwaitDisabled,

    /// The peer closed the channel while we were blocked on it.
    #[error("queue: channel closed by peer")]
    Orphaned,

    /// A frame violated the wire protocol. Fatal to the dispatcher.
    #[error("queue wire: {0}")]
    Wire(&'static str),

    /// A frame led with a tag that is not in the opcode table.
    #[error("queue wire: unknown opcode {0:?}")]
    UnknownOpcode(String),

    /// Socket-level failure underneath a queue operation.
    #[error(transparent)]
    Os(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
