use crate::cluster::Member;
use crate::consensus::commit_stream::CommitStreamPublisher;
use crate::consensus::local_state::Term;
use crate::protocol;
use bytes::{Bytes, BytesMut};
use std::{fmt, io};

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
struct U64NonZero(u64);

impl U64NonZero {
    fn new(val: u64) -> Self {
        assert_ne!(val, 0);
        U64NonZero(val)
    }
}

/// Position is the address of an entry in the partition's log. Positions start at 1
/// and increase monotonically; there is no entry at position 0.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Position(U64NonZero);

impl Position {
    pub fn new(position: u64) -> Self {
        Position(U64NonZero::new(position))
    }

    pub fn start_position() -> Self {
        Self::new(1)
    }

    pub fn as_u64(&self) -> u64 {
        (self.0).0
    }

    pub fn plus(&self, delta: u64) -> Position {
        Position::new(self.as_u64() + delta)
    }

    pub fn checked_minus(&self, delta: u64) -> Option<Position> {
        let new_value = self.as_u64() - delta;
        if new_value > 0 {
            Some(Position::new(new_value))
        } else {
            None
        }
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", (self.0).0)
    }
}

/// What a log entry carries. Data entries are opaque records submitted by the
/// application layer; configuration entries carry a full member list and linearize
/// membership changes with data replication.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryPayload {
    Data(Bytes),
    Configuration(Vec<Member>),
}

const PAYLOAD_TAG_DATA: u8 = 0;
const PAYLOAD_TAG_CONFIGURATION: u8 = 1;

impl EntryPayload {
    pub fn encode(&self) -> Bytes {
        match self {
            EntryPayload::Data(data) => {
                let mut buf = BytesMut::with_capacity(1 + data.len());
                buf.extend_from_slice(&[PAYLOAD_TAG_DATA]);
                buf.extend_from_slice(data);
                buf.freeze()
            }
            EntryPayload::Configuration(members) => {
                let encoded = protocol::encode_membership(members);
                let mut buf = BytesMut::with_capacity(1 + encoded.len());
                buf.extend_from_slice(&[PAYLOAD_TAG_CONFIGURATION]);
                buf.extend_from_slice(&encoded);
                buf.freeze()
            }
        }
    }

    pub fn decode(raw: &[u8]) -> Result<EntryPayload, protocol::DecodeError> {
        match raw.first() {
            Some(&PAYLOAD_TAG_DATA) => Ok(EntryPayload::Data(Bytes::copy_from_slice(&raw[1..]))),
            Some(&PAYLOAD_TAG_CONFIGURATION) => {
                Ok(EntryPayload::Configuration(protocol::decode_membership(&raw[1..])?))
            }
            _ => Err(protocol::DecodeError::InvalidValue("entry payload tag")),
        }
    }
}

/// One entry as stored in the replicated log.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatedEntry {
    pub term: Term,
    pub payload: EntryPayload,
}

/// LogStorage is the seam to the append-only storage engine backing the log. The
/// file-based engine lives outside this crate; the in-memory implementation below is
/// used for tests and for embedding without durability.
///
/// Entries live at positions `first_position()..next_position()`. Compaction moves
/// `first_position()` forward without affecting `next_position()`.
pub trait LogStorage {
    /// Append at `next_position()`, returning the position used.
    fn append(&mut self, entry: ReplicatedEntry) -> Result<Position, io::Error>;

    /// Read the entry at `position`. None if compacted away or not yet written.
    fn read(&self, position: Position) -> Result<Option<ReplicatedEntry>, io::Error>;

    /// Remove `position` and everything after it.
    fn truncate_from(&mut self, position: Position);

    /// Oldest retained position. None when the log holds no entries.
    fn first_position(&self) -> Option<Position>;

    /// Position the next append will use.
    fn next_position(&self) -> Position;

    /// Drop all entries at or before `position`. Entries after it are retained.
    fn compact_up_to(&mut self, position: Position);

    /// Discard everything and restart the log immediately after `position`. Used
    /// after installing a snapshot whose index is past our stored entries.
    fn reset_to(&mut self, position: Position);
}

pub struct InMemoryLogStorage {
    // Position of entries[0], when non-empty.
    base: u64,
    entries: Vec<ReplicatedEntry>,
}

impl InMemoryLogStorage {
    pub fn new() -> Self {
        InMemoryLogStorage {
            base: 1,
            entries: Vec::new(),
        }
    }

    fn vec_index(&self, position: Position) -> Option<usize> {
        let p = position.as_u64();
        if p < self.base {
            return None;
        }
        let offset = (p - self.base) as usize;
        if offset >= self.entries.len() {
            return None;
        }
        Some(offset)
    }
}

impl LogStorage for InMemoryLogStorage {
    fn append(&mut self, entry: ReplicatedEntry) -> Result<Position, io::Error> {
        self.entries.push(entry);
        Ok(Position::new(self.base + self.entries.len() as u64 - 1))
    }

    fn read(&self, position: Position) -> Result<Option<ReplicatedEntry>, io::Error> {
        Ok(self.vec_index(position).map(|i| self.entries[i].clone()))
    }

    fn truncate_from(&mut self, position: Position) {
        let p = position.as_u64();
        if p <= self.base {
            self.entries.clear();
        } else {
            let keep = (p - self.base) as usize;
            self.entries.truncate(keep.min(self.entries.len()));
        }
    }

    fn first_position(&self) -> Option<Position> {
        if self.entries.is_empty() {
            None
        } else {
            Some(Position::new(self.base))
        }
    }

    fn next_position(&self) -> Position {
        Position::new(self.base + self.entries.len() as u64)
    }

    fn compact_up_to(&mut self, position: Position) {
        let p = position.as_u64();
        if p < self.base {
            return;
        }
        let drop_count = ((p - self.base + 1) as usize).min(self.entries.len());
        self.entries.drain(..drop_count);
        self.base += drop_count as u64;
    }

    fn reset_to(&mut self, position: Position) {
        self.entries.clear();
        self.base = position.as_u64() + 1;
    }
}

/// ReplicatedLog is the consensus-specific facade over [LogStorage].
///
/// Note: a log entry has 3 states (not modeled directly in code):
/// 1. Persisted - written locally, not yet replicated to majority
/// 2. Committed - replicated to majority
/// 3. Published - a committed entry handed to the commit stream for the
///    application layer's log readers
///
/// A log entry's state has no global truth. Each replica has its own local view of
/// what state an entry is in.
pub struct ReplicatedLog<L: LogStorage> {
    logger: slog::Logger,
    storage: L,

    // Metadata of the highest locally written entry; must track storage exactly.
    latest_entry_metadata: Option<(Term, Position)>,

    // Term/position the current snapshot covers; entries at or before this are
    // compacted away. The consistency check treats this bound as a real entry.
    snapshot_bound: Option<(Term, Position)>,

    commit_stream: CommitStreamPublisher,
    commit_position: Option<Position>,
    last_published_position: Option<Position>,
}

/// Configuration entries that just became committed; the engine applies these to the
/// active cluster configuration.
pub struct CommittedConfiguration {
    pub position: Position,
    pub term: Term,
    pub members: Vec<Member>,
}

impl<L: LogStorage> ReplicatedLog<L> {
    pub fn new(logger: slog::Logger, storage: L, commit_stream: CommitStreamPublisher) -> Self {
        assert_eq!(
            storage.next_position(),
            Position::start_position(),
            "We only know how to initialize from an empty log."
        );

        ReplicatedLog {
            logger,
            storage,
            latest_entry_metadata: None,
            snapshot_bound: None,
            commit_stream,
            commit_position: None,
            last_published_position: None,
        }
    }

    /// Highest locally written entry, falling back to the snapshot bound when the log
    /// has been fully compacted.
    pub fn latest_entry(&self) -> Option<(Term, Position)> {
        self.latest_entry_metadata.or(self.snapshot_bound)
    }

    pub fn first_position(&self) -> Option<Position> {
        self.storage.first_position()
    }

    pub fn next_position(&self) -> Position {
        self.storage.next_position()
    }

    pub fn snapshot_bound(&self) -> Option<(Term, Position)> {
        self.snapshot_bound
    }

    pub fn read(&self, position: Position) -> Result<Option<ReplicatedEntry>, io::Error> {
        self.storage.read(position)
    }

    fn read_required(&self, position: Position) -> Result<ReplicatedEntry, io::Error> {
        match self.read(position) {
            Ok(Some(entry)) => Ok(entry),
            Ok(None) => panic!("read_required() found no log entry at position {:?}", position),
            Err(ioe) => Err(ioe),
        }
    }

    /// Does our log hold `(term, position)`? The snapshot bound counts: everything a
    /// snapshot covers is by definition present and committed.
    pub fn contains_entry(&self, term: Term, position: Position) -> Result<bool, io::Error> {
        if let Some((snapshot_term, snapshot_position)) = self.snapshot_bound {
            if position == snapshot_position {
                return Ok(term == snapshot_term);
            }
            if position < snapshot_position {
                // Compacted away; covered entries were committed, so the term matched.
                return Ok(true);
            }
        }

        match self.read(position)? {
            Some(entry) => Ok(entry.term == term),
            None => Ok(false),
        }
    }

    /// Remove `position` and everything after it.
    pub fn truncate_from(&mut self, position: Position) -> Result<(), io::Error> {
        let mut new_latest_entry_metadata = None;
        if let Some(new_latest_position) = position.checked_minus(1) {
            new_latest_entry_metadata = self
                .read(new_latest_position)?
                .map(|latest_entry| (latest_entry.term, new_latest_position));
        }

        self.storage.truncate_from(position);
        self.latest_entry_metadata = new_latest_entry_metadata;
        Ok(())
    }

    pub fn append(&mut self, entry: ReplicatedEntry) -> Result<Position, io::Error> {
        let appended_term = entry.term;
        let appended_position = self.storage.append(entry)?;
        // Only update state after the storage action completes.
        self.latest_entry_metadata = Some((appended_term, appended_position));

        Ok(appended_position)
    }

    pub fn commit_position(&self) -> Option<Position> {
        self.commit_position
    }

    /// Leader-side commit advance: only ratchet if the entry at the tentative
    /// position was written in the current term. Entries from older terms are
    /// committed implicitly once a current-term entry on top of them commits.
    pub fn ratchet_fwd_commit_position_if_valid(
        &mut self,
        tentative_commit_position: Position,
        current_term: Term,
    ) -> Result<(), io::Error> {
        if let Some(current_commit_position) = self.commit_position {
            if tentative_commit_position <= current_commit_position {
                return Ok(());
            }
        }

        let entry = self.read_required(tentative_commit_position)?;
        if entry.term != current_term {
            return Ok(());
        }

        self.ratchet_fwd_commit_position_panicking(tentative_commit_position);
        Ok(())
    }

    /// Follower-side commit advance, already clamped by the caller to
    /// min(leader commit, own last position).
    pub fn ratchet_fwd_commit_position_if_changed(&mut self, new_commit_position: Position) {
        if matches!(self.commit_position, Some(cp) if cp >= new_commit_position) {
            return;
        }

        self.ratchet_fwd_commit_position_panicking(new_commit_position);
    }

    fn ratchet_fwd_commit_position_panicking(&mut self, new_commit_position: Position) {
        if let Some(current_commit_position) = self.commit_position {
            assert!(
                new_commit_position > current_commit_position,
                "Can't ratchet commit position backwards. Expected [input] {:?} > {:?} [current]",
                new_commit_position,
                current_commit_position,
            );
        }

        let latest_local_position = self
            .latest_entry()
            .expect("Can't ratchet commit position forward with no local entries")
            .1;
        assert!(
            latest_local_position >= new_commit_position,
            "Can't ratchet commit position past our local log. Expected [latest] {:?} >= {:?} [input]",
            latest_local_position,
            new_commit_position,
        );

        self.commit_position.replace(new_commit_position);
    }

    /// Publish all committed-but-unpublished entries in position order. Data entries
    /// go to the commit stream; configuration entries are returned for the engine to
    /// apply to the active membership.
    pub fn publish_committed_entries(&mut self) -> Vec<CommittedConfiguration> {
        match self.try_publish_committed_entries() {
            Ok(configurations) => configurations,
            Err(e) => {
                // Entries are already persisted; publishing retries on the next commit
                // advancement.
                slog::error!(self.logger, "Failed to publish a committed entry. {:?}", e);
                Vec::new()
            }
        }
    }

    fn try_publish_committed_entries(&mut self) -> Result<Vec<CommittedConfiguration>, io::Error> {
        let commit_position = match self.commit_position {
            Some(cp) => cp,
            None => return Ok(Vec::new()),
        };

        let mut next_to_publish = match self.last_published_position {
            Some(published) => published.plus(1),
            None => match self.first_position() {
                Some(first) => first,
                None => return Ok(Vec::new()),
            },
        };

        let mut configurations = Vec::new();
        while next_to_publish <= commit_position {
            let entry = self.read_required(next_to_publish)?;
            match entry.payload {
                EntryPayload::Data(data) => {
                    self.commit_stream
                        .notify_commit(&self.logger, entry.term, next_to_publish, data);
                }
                EntryPayload::Configuration(members) => {
                    configurations.push(CommittedConfiguration {
                        position: next_to_publish,
                        term: entry.term,
                        members,
                    });
                }
            }
            self.last_published_position.replace(next_to_publish);

            if next_to_publish == commit_position {
                break;
            }
            next_to_publish = next_to_publish.plus(1);
        }

        Ok(configurations)
    }

    /// Drop entries covered by a locally taken snapshot. Only committed entries may
    /// be compacted.
    pub fn compact_up_to(&mut self, term: Term, position: Position) {
        if let Some(commit_position) = self.commit_position {
            assert!(
                position <= commit_position,
                "Can't compact uncommitted entries. Compaction {:?} > commit {:?}",
                position,
                commit_position,
            );
        } else {
            panic!("Can't compact with no committed entries.");
        }

        self.storage.compact_up_to(position);
        self.snapshot_bound = Some((term, position));
        if self.storage.first_position().is_none() {
            self.latest_entry_metadata = None;
        }
        if self.last_published_position.map_or(true, |p| p < position) {
            // Covered entries were applied by the snapshot producer.
            self.last_published_position = Some(position);
        }
    }

    /// Adopt a remotely produced snapshot: everything we hold is superseded.
    pub fn reset_to_snapshot(&mut self, term: Term, position: Position) {
        self.storage.reset_to(position);
        self.snapshot_bound = Some((term, position));
        self.latest_entry_metadata = None;
        self.commit_position = Some(position);
        self.last_published_position = Some(position);
    }
}
