//! Accumulated change set for one execution.

use forge_protocol::Change;
use forge_protocol::ChangeKind;

/// Ordered set of proposed changes holding at most one entry per file name.
///
/// Recording a change for a file that already has one replaces the proposal
/// in place while keeping the first recorded original content, so the entry
/// always describes "pre-session content → latest proposal".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from a list that may contain duplicates; later entries
    /// win.
    pub fn from_changes(changes: impl IntoIterator<Item = Change>) -> Self {
        let mut set = Self::new();
        for change in changes {
            set.record(change);
        }
        set
    }

    /// Records `change`; returns true when the set content actually changed.
    pub fn record(&mut self, mut change: Change) -> bool {
        match self
            .changes
            .iter_mut()
            .find(|existing| existing.file_name == change.file_name)
        {
            Some(existing) => {
                change.original_content = std::mem::take(&mut existing.original_content);
                if existing.kind == ChangeKind::Create && change.kind == ChangeKind::Modify {
                    change.kind = ChangeKind::Create;
                }
                let changed = existing.proposed_content != change.proposed_content
                    || existing.kind != change.kind;
                *existing = change;
                changed
            }
            None => {
                self.changes.push(change);
                true
            }
        }
    }

    pub fn get(&self, file_name: &str) -> Option<&Change> {
        self.changes.iter().find(|change| change.file_name == file_name)
    }

    pub fn remove(&mut self, file_name: &str) -> Option<Change> {
        let index = self.changes.iter().position(|change| change.file_name == file_name)?;
        Some(self.changes.remove(index))
    }

    /// Drops entries whose proposal equals their original content.
    pub fn prune_noops(&mut self) {
        self.changes.retain(|change| {
            change.kind != ChangeKind::Modify || change.original_content != change.proposed_content
        });
    }

    pub fn clear(&mut self) {
        self.changes.clear();
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    pub fn file_names(&self) -> Vec<String> {
        self.changes.iter().map(|change| change.file_name.clone()).collect()
    }

    pub fn as_slice(&self) -> &[Change] {
        &self.changes
    }

    pub fn into_vec(self) -> Vec<Change> {
        self.changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn change(name: &str, original: &str, proposed: &str) -> Change {
        Change {
            file_id: name.to_string(),
            file_name: name.to_string(),
            original_content: original.to_string(),
            proposed_content: proposed.to_string(),
            rationale: String::new(),
            agent: "main".to_string(),
            kind: ChangeKind::Modify,
        }
    }

    #[test]
    fn test_latest_proposal_wins_and_keeps_original() {
        let mut set = ChangeSet::new();
        assert!(set.record(change("a.liquid", "v0", "v1")));
        assert!(set.record(change("a.liquid", "v1", "v2")));
        assert!(!set.record(change("a.liquid", "v2", "v2")));

        assert_eq!(set.len(), 1);
        let entry = set.get("a.liquid").unwrap();
        assert_eq!(entry.original_content, "v0");
        assert_eq!(entry.proposed_content, "v2");
    }

    #[test]
    fn test_created_file_stays_create() {
        let mut set = ChangeSet::new();
        let mut created = change("new.liquid", "", "one");
        created.kind = ChangeKind::Create;
        set.record(created);
        set.record(change("new.liquid", "one", "two"));
        assert_eq!(set.get("new.liquid").unwrap().kind, ChangeKind::Create);
    }

    #[test]
    fn test_prune_noops() {
        let mut set = ChangeSet::new();
        set.record(change("a", "x", "y"));
        set.record(change("a", "y", "x"));
        set.record(change("b", "1", "2"));
        set.prune_noops();
        assert_eq!(set.file_names(), vec!["b".to_string()]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn change_set_holds_one_entry_per_file(
            writes in prop::collection::vec((0..6usize, "[a-z]{0,8}"), 0..40)
        ) {
            let mut set = ChangeSet::new();
            for (file, content) in &writes {
                set.record(change(&format!("f{file}.liquid"), "orig", content));
            }
            let mut names = set.file_names();
            let total = names.len();
            names.sort();
            names.dedup();
            prop_assert_eq!(names.len(), total);

            for (file, _) in &writes {
                let last = writes.iter().rev().find(|(f, _)| f == file).unwrap();
                let name = format!("f{file}.liquid");
                prop_assert_eq!(&set.get(&name).unwrap().proposed_content, &last.1);
                prop_assert_eq!(&set.get(&name).unwrap().original_content, "orig");
            }
        }
    }
}
