use tokio::sync::oneshot;
use tokio::sync::oneshot::Receiver;
use tokio::sync::oneshot::Sender;

use crate::error::RaftError;
use crate::raft::LogIndex;

/// A local write accepted by the leader, waiting for its entry to be
/// committed and applied. The sender fires once, with the applied index
/// or the error that ended the attempt.
pub struct Proposal {
    pub index: LogIndex,
    pub done: Option<Sender<std::result::Result<LogIndex, RaftError>>>,
}

impl Proposal {
    pub fn new(index: LogIndex) -> (Self, Receiver<std::result::Result<LogIndex, RaftError>>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            index,
            done: Some(tx),
        };
        (proposal, rx)
    }
}
