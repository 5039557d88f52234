//! Classifies fetched units against the stored snapshot set.
//!
//! Drive documents and Notion blocks share one classifier: a unit has a key,
//! a version marker and text content. Only a changed version triggers a diff.
use std::collections::{HashMap, HashSet};

use crate::diff::{self, DiffError, DiffOptions};
use crate::drive::RevisionMeta;
use crate::model::{ChangeSet, DriveRevision, NotionBlock};

pub trait TrackedUnit {
    type Version: PartialEq;

    fn unit_key(&self) -> &str;
    fn version(&self) -> Self::Version;
    fn content(&self) -> &str;
}

/// Drive documents are tracked as a single unit whose version is the revision id.
impl TrackedUnit for DriveRevision {
    type Version = String;

    fn unit_key(&self) -> &str {
        &self.document_id
    }

    fn version(&self) -> String {
        self.revision_id.clone()
    }

    fn content(&self) -> &str {
        &self.plain_text
    }
}

impl TrackedUnit for NotionBlock {
    type Version = chrono::DateTime<chrono::Utc>;

    fn unit_key(&self) -> &str {
        &self.block_id
    }

    fn version(&self) -> Self::Version {
        self.last_edited_time
    }

    fn content(&self) -> &str {
        &self.plain_text
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitChange<'a, U> {
    Added(&'a U),
    Deleted(&'a U),
    Updated { old: &'a U, new: &'a U },
    /// Version unchanged; never diffed even if stored text differs.
    Unchanged(&'a U),
}

impl<'a, U: TrackedUnit> UnitChange<'a, U> {
    pub fn key(&self) -> &'a str {
        let unit: &'a U = match self {
            UnitChange::Added(u) | UnitChange::Deleted(u) | UnitChange::Unchanged(u) => *u,
            UnitChange::Updated { new, .. } => *new,
        };
        unit.unit_key()
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            UnitChange::Added(_) => ChangeKind::Added,
            UnitChange::Deleted(_) => ChangeKind::Deleted,
            UnitChange::Updated { .. } => ChangeKind::Updated,
            UnitChange::Unchanged(_) => ChangeKind::Unchanged,
        }
    }

    /// Text-level changes for this unit. `Unchanged` yields an empty set
    /// without running the diff.
    pub fn diff(&self, opts: &DiffOptions) -> Result<ChangeSet, DiffError> {
        match self {
            UnitChange::Added(new) => diff::diff_with("", new.content(), opts),
            UnitChange::Deleted(old) => diff::diff_with(old.content(), "", opts),
            UnitChange::Updated { old, new } => {
                diff::diff_with(old.content(), new.content(), opts)
            }
            UnitChange::Unchanged(_) => Ok(ChangeSet::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Deleted,
    Updated,
    Unchanged,
}

#[derive(Debug)]
pub struct Classification<'a, U> {
    pub changes: Vec<UnitChange<'a, U>>,
    /// Fetched units whose key was already seen earlier in the fetched set.
    pub duplicates: Vec<&'a U>,
}

/// Classify every key in `stored ∪ fetched` exactly once. Output follows
/// fetched order, then deleted units in stored order.
pub fn classify<'a, U: TrackedUnit>(stored: &'a [U], fetched: &'a [U]) -> Classification<'a, U> {
    let stored_by_key: HashMap<&str, &U> = stored.iter().map(|u| (u.unit_key(), u)).collect();

    let mut seen: HashSet<&str> = HashSet::with_capacity(fetched.len());
    let mut changes = Vec::with_capacity(fetched.len() + stored.len());
    let mut duplicates = Vec::new();

    for new in fetched {
        if !seen.insert(new.unit_key()) {
            duplicates.push(new);
            continue;
        }
        let change = match stored_by_key.get(new.unit_key()).copied() {
            None => UnitChange::Added(new),
            Some(old) if old.version() == new.version() => UnitChange::Unchanged(new),
            Some(old) => UnitChange::Updated { old, new },
        };
        changes.push(change);
    }

    for old in stored {
        if !seen.contains(old.unit_key()) {
            changes.push(UnitChange::Deleted(old));
        }
    }

    Classification {
        changes,
        duplicates,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveDecision {
    /// Latest revision is the one already processed.
    UpToDate,
    /// Fetched latest revision is older than what was already processed.
    Stale,
    Process,
}

/// Decide whether a Drive document's latest revision needs processing,
/// before its content is downloaded. `prior` is the snapshot at the tracking
/// cursor, absent on first sync.
pub fn drive_decision(prior: Option<&DriveRevision>, latest: &RevisionMeta) -> DriveDecision {
    match prior {
        Some(p) if p.version() == latest.revision_id => DriveDecision::UpToDate,
        Some(p) if latest.modified_time < p.modified_time => DriveDecision::Stale,
        _ => DriveDecision::Process,
    }
}
