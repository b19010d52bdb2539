use crate::consensus::api::{
    ActorExited, AppendReplyFromPeer, HeartbeatTick, JoinInput, LeaveInput, MembershipChangeError,
    MembershipChangeOutput, SnapshotInstalled, SnapshotTransferResult, StartReplicationError, StartReplicationInput,
    StartReplicationOutput, VoteReplyFromPeer,
};
use crate::consensus::{LogStorage, PersistentLocalState, Replica};
use crate::protocol;
use crate::snapshot::{SnapshotChunk, SnapshotStoreError};
use tokio::sync::{mpsc, oneshot};

// The replica actor is the single mutation point for one partition's consensus
// state. Every operation, timer tick, and peer reply becomes one Event; the event
// loop below applies them strictly in order.
#[derive(Debug)]
pub(crate) enum Event {
    // Leader: append to local log, replicate on next peer ticks.
    // Candidate/Follower: redirect or reject.
    StartReplication(
        StartReplicationInput,
        Callback<StartReplicationOutput, StartReplicationError>,
    ),

    // Grant or deny a vote; may adopt a larger term and become follower.
    VoteRequest(protocol::VoteRequest, Reply<protocol::VoteResponse>),

    // Pre-vote probe; answered without any state mutation.
    PollRequest(protocol::PollRequest, Reply<protocol::PollResponse>),

    // Consistency-check, append, advance commit. May adopt a leader.
    AppendRequest(protocol::AppendRequest, Reply<protocol::AppendResponse>),

    // Committed-membership broadcast from the current leader.
    ConfigureRequest(protocol::ConfigureRequest, Reply<protocol::ConfigureResponse>),

    // Leader: propose a Configure entry; completes when it commits.
    Join(JoinInput, Callback<MembershipChangeOutput, MembershipChangeError>),
    Leave(LeaveInput, Callback<MembershipChangeOutput, MembershipChangeError>),

    // Follower: hand a received chunk to the snapshot store.
    InstallSnapshotChunk(SnapshotChunk, Callback<bool, SnapshotStoreError>),

    // Candidate: tally votes, maybe become leader. Other roles: discard.
    VoteReplyFromPeer(VoteReplyFromPeer),

    // Leader: advance the peer cursor and the commit position. Other roles: discard.
    AppendReplyFromPeer(AppendReplyFromPeer),

    // Leader: resume AppendEntries for a peer after its snapshot transfer.
    SnapshotTransferCompleted(SnapshotTransferResult),

    // Follower: a received snapshot was persisted; reset the log onto it.
    SnapshotInstalled(SnapshotInstalled),

    // Leader: send AppendEntries (heartbeat or entries) to one peer.
    HeartbeatTimer(HeartbeatTick),

    // Follower/Candidate: start a new election.
    ElectionTimeout,
}

#[derive(Debug)]
pub(crate) struct Callback<O, E>(oneshot::Sender<Result<O, E>>);

impl<O, E> Callback<O, E> {
    pub(crate) fn new(sender: oneshot::Sender<Result<O, E>>) -> Self {
        Callback(sender)
    }

    pub(crate) fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

#[derive(Debug)]
pub(crate) struct Reply<T>(oneshot::Sender<T>);

impl<T> Reply<T> {
    pub(crate) fn send(self, message: T) {
        let _ = self.0.send(message);
    }
}

/// Submits work to the replica actor. Holding an ActorClient keeps the actor alive;
/// internal tasks (timers, peer calls) hold a [WeakActorClient] instead so the actor
/// can shut down when the embedding layer drops its handle.
#[derive(Clone)]
pub struct ActorClient {
    sender: mpsc::Sender<Event>,
}

#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (ActorClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub async fn start_replication(
        &self,
        input: StartReplicationInput,
    ) -> Result<StartReplicationOutput, StartReplicationError> {
        let (tx, rx) = oneshot::channel();
        if self.send(Event::StartReplication(input, Callback(tx))).await.is_err() {
            return Err(StartReplicationError::ActorExited);
        }

        rx.await.unwrap_or(Err(StartReplicationError::ActorExited))
    }

    pub async fn vote_request(&self, request: protocol::VoteRequest) -> Result<protocol::VoteResponse, ActorExited> {
        self.request(|tx| Event::VoteRequest(request, Reply(tx))).await
    }

    pub async fn poll_request(&self, request: protocol::PollRequest) -> Result<protocol::PollResponse, ActorExited> {
        self.request(|tx| Event::PollRequest(request, Reply(tx))).await
    }

    pub async fn append_request(
        &self,
        request: protocol::AppendRequest,
    ) -> Result<protocol::AppendResponse, ActorExited> {
        self.request(|tx| Event::AppendRequest(request, Reply(tx))).await
    }

    pub async fn configure_request(
        &self,
        request: protocol::ConfigureRequest,
    ) -> Result<protocol::ConfigureResponse, ActorExited> {
        self.request(|tx| Event::ConfigureRequest(request, Reply(tx))).await
    }

    pub async fn join(&self, input: JoinInput) -> Result<MembershipChangeOutput, MembershipChangeError> {
        let (tx, rx) = oneshot::channel();
        if self.send(Event::Join(input, Callback(tx))).await.is_err() {
            return Err(MembershipChangeError::ActorExited);
        }

        rx.await.unwrap_or(Err(MembershipChangeError::ActorExited))
    }

    pub async fn leave(&self, input: LeaveInput) -> Result<MembershipChangeOutput, MembershipChangeError> {
        let (tx, rx) = oneshot::channel();
        if self.send(Event::Leave(input, Callback(tx))).await.is_err() {
            return Err(MembershipChangeError::ActorExited);
        }

        rx.await.unwrap_or(Err(MembershipChangeError::ActorExited))
    }

    pub async fn install_snapshot_chunk(&self, chunk: SnapshotChunk) -> Result<bool, SnapshotStoreError> {
        let (tx, rx) = oneshot::channel();
        if self.send(Event::InstallSnapshotChunk(chunk, Callback(tx))).await.is_err() {
            return Err(SnapshotStoreError::ActorExited);
        }

        rx.await.unwrap_or(Err(SnapshotStoreError::ActorExited))
    }

    async fn request<T>(&self, make_event: impl FnOnce(oneshot::Sender<T>) -> Event) -> Result<T, ActorExited> {
        let (tx, rx) = oneshot::channel();
        self.send(make_event(tx)).await?;

        rx.await.map_err(|_| ActorExited)
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        self.sender.send(event).await.map_err(|_| ActorExited)
    }
}

impl WeakActorClient {
    pub(crate) async fn election_timeout(&self) -> Result<(), ActorExited> {
        self.send(Event::ElectionTimeout).await
    }

    pub(crate) async fn heartbeat_timer(&self, tick: HeartbeatTick) -> Result<(), ActorExited> {
        self.send(Event::HeartbeatTimer(tick)).await
    }

    pub(crate) async fn vote_reply_from_peer(&self, reply: VoteReplyFromPeer) -> Result<(), ActorExited> {
        self.send(Event::VoteReplyFromPeer(reply)).await
    }

    pub(crate) async fn append_reply_from_peer(&self, reply: AppendReplyFromPeer) -> Result<(), ActorExited> {
        self.send(Event::AppendReplyFromPeer(reply)).await
    }

    pub(crate) async fn snapshot_transfer_completed(&self, result: SnapshotTransferResult) -> Result<(), ActorExited> {
        self.send(Event::SnapshotTransferCompleted(result)).await
    }

    pub(crate) async fn snapshot_installed(&self, installed: SnapshotInstalled) -> Result<(), ActorExited> {
        self.send(Event::SnapshotInstalled(installed)).await
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        let sender = self.sender.upgrade().ok_or(ActorExited)?;
        sender.send(event).await.map_err(|_| ActorExited)
    }
}

/// ReplicaActor is the event loop owning one partition's [Replica].
pub struct ReplicaActor<L, S>
where
    L: LogStorage,
    S: PersistentLocalState,
{
    receiver: mpsc::Receiver<Event>,
    replica: Replica<L, S>,
}

impl<L, S> ReplicaActor<L, S>
where
    L: LogStorage + 'static,
    S: PersistentLocalState + 'static,
{
    pub(crate) fn new(receiver: mpsc::Receiver<Event>, replica: Replica<L, S>) -> Self {
        ReplicaActor { receiver, replica }
    }

    pub async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);
        }
    }

    // This must NOT be async. Any long running work is spawned on another task
    // and/or comes back to this actor as an event.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::StartReplication(input, callback) => {
                let result = self.replica.handle_start_replication(input);
                callback.send(result);
            }
            Event::VoteRequest(request, reply) => {
                reply.send(self.replica.handle_vote_request(request));
            }
            Event::PollRequest(request, reply) => {
                reply.send(self.replica.handle_poll_request(request));
            }
            Event::AppendRequest(request, reply) => {
                reply.send(self.replica.handle_append_request(request));
            }
            Event::ConfigureRequest(request, reply) => {
                reply.send(self.replica.handle_configure_request(request));
            }
            Event::Join(input, callback) => {
                self.replica.handle_join(input, callback);
            }
            Event::Leave(input, callback) => {
                self.replica.handle_leave(input, callback);
            }
            Event::InstallSnapshotChunk(chunk, callback) => {
                self.replica.handle_install_snapshot_chunk(chunk, callback);
            }
            Event::VoteReplyFromPeer(reply) => {
                self.replica.handle_vote_reply_from_peer(reply);
            }
            Event::AppendReplyFromPeer(reply) => {
                self.replica.handle_append_reply_from_peer(reply);
            }
            Event::SnapshotTransferCompleted(result) => {
                self.replica.handle_snapshot_transfer_completed(result);
            }
            Event::SnapshotInstalled(installed) => {
                self.replica.handle_snapshot_installed(installed);
            }
            Event::HeartbeatTimer(tick) => {
                self.replica.handle_heartbeat_timer(tick);
            }
            Event::ElectionTimeout => {
                self.replica.handle_election_timeout();
            }
        }
    }
}
