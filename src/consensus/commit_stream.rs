use crate::consensus::local_state::Term;
use crate::consensus::log::Position;
use bytes::Bytes;
use tokio::sync::mpsc;

/// CommitStream is the boundary through which the application layer's log readers
/// observe committed entries. Configuration entries are applied internally and never
/// appear here.
pub struct CommitStream {
    receiver: mpsc::UnboundedReceiver<CommittedEntry>,
}

pub(crate) struct CommitStreamPublisher {
    sender: mpsc::UnboundedSender<CommittedEntry>,
}

pub struct CommittedEntry {
    pub term: Term,
    pub position: Position,
    pub payload: Bytes,
}

pub(crate) fn new() -> (CommitStreamPublisher, CommitStream) {
    let (tx, rx) = mpsc::unbounded_channel();

    (CommitStreamPublisher { sender: tx }, CommitStream { receiver: rx })
}

impl CommitStreamPublisher {
    pub(crate) fn notify_commit(&self, logger: &slog::Logger, term: Term, position: Position, payload: Bytes) {
        let committed_entry = CommittedEntry { term, position, payload };

        if let Err(_) = self.sender.send(committed_entry) {
            slog::warn!(logger, "CommitStream has disconnected.");
        }
    }
}

impl CommitStream {
    pub async fn recv(&mut self) -> Option<CommittedEntry> {
        self.receiver.recv().await
    }

    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<CommittedEntry> {
        self.receiver.try_recv().ok()
    }
}
