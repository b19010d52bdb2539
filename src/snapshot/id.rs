use crate::consensus::{Position, Term};
use std::fmt;
use std::str::FromStr;

/// SnapshotId identifies one snapshot of a partition's state. The index is the log
/// position up to which the snapshot compacts the log; processed/exported positions
/// are the stream processor's progress markers captured with it.
///
/// The id doubles as the on-disk directory name, `index-term-processed-exported`,
/// so discovery can recover all metadata from a directory listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotId {
    pub index: Position,
    pub term: Term,
    pub processed_position: u64,
    pub exported_position: u64,
}

impl SnapshotId {
    pub fn new(index: Position, term: Term, processed_position: u64, exported_position: u64) -> Self {
        SnapshotId {
            index,
            term,
            processed_position,
            exported_position,
        }
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.index.as_u64(),
            self.term.as_u64(),
            self.processed_position,
            self.exported_position
        )
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
#[error("not a snapshot id: {0}")]
pub struct InvalidSnapshotId(pub String);

impl FromStr for SnapshotId {
    type Err = InvalidSnapshotId;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidSnapshotId(raw.to_string());

        let mut parts = raw.splitn(4, '-');
        let index: u64 = parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
        let term: u64 = parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
        let processed: u64 = parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
        let exported: u64 = parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;

        if index == 0 {
            return Err(invalid());
        }

        Ok(SnapshotId {
            index: Position::new(index),
            term: Term::new(term),
            processed_position: processed,
            exported_position: exported,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_round_trip() {
        let id = SnapshotId::new(Position::new(17), Term::new(3), 1200, 1100);
        let rendered = id.to_string();
        assert_eq!(rendered, "17-3-1200-1100");
        assert_eq!(rendered.parse::<SnapshotId>().unwrap(), id);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<SnapshotId>().is_err());
        assert!("17".parse::<SnapshotId>().is_err());
        assert!("17-3".parse::<SnapshotId>().is_err());
        assert!("17-3-abc-1".parse::<SnapshotId>().is_err());
        assert!("0-3-1-1".parse::<SnapshotId>().is_err());
        assert!("pending".parse::<SnapshotId>().is_err());
    }
}
