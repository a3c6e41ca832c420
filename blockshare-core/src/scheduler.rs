//! Download planning: which peers serve a file, how search results group, who delivered what.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::identity::NodeIdentity;
use crate::protocol::FileSearchResult;

/// Search results grouped by content hash: one entry per distinct file content,
/// each listing every peer/name combination that offers it.
pub type SearchGroups = HashMap<String, Vec<FileSearchResult>>;

/// Group results by `content_hash`, keeping arrival order inside each group.
pub fn group_by_content(results: impl IntoIterator<Item = FileSearchResult>) -> SearchGroups {
    let mut groups = SearchGroups::new();
    for r in results {
        groups.entry(r.content_hash.clone()).or_default().push(r);
    }
    groups
}

/// Distinct responders in first-seen order. A peer listing the same content
/// under two names still gets a single worker.
pub fn providers_for(results: &[FileSearchResult]) -> Vec<NodeIdentity> {
    let mut out: Vec<NodeIdentity> = Vec::new();
    for r in results {
        let id = r.responder();
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

/// Blocks received per peer for one download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockTally {
    counts: BTreeMap<NodeIdentity, usize>,
}

impl BlockTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, peer: &NodeIdentity) {
        *self.counts.entry(peer.clone()).or_insert(0) += 1;
    }

    pub fn count(&self, peer: &NodeIdentity) -> usize {
        self.counts.get(peer).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeIdentity, usize)> {
        self.counts.iter().map(|(p, n)| (p, *n))
    }
}

impl fmt::Display for BlockTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (peer, n) in self.iter() {
            writeln!(f, "Provider {}: {} blocks", peer, n)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, hash: &str, port: u16) -> FileSearchResult {
        FileSearchResult {
            file_name: name.into(),
            file_size: 10,
            content_hash: hash.into(),
            responder_host: "localhost".into(),
            responder_port: port,
        }
    }

    #[test]
    fn groups_by_hash() {
        let groups = group_by_content(vec![
            result("a.txt", "h1", 1),
            result("b.txt", "h2", 1),
            result("a-copy.txt", "h1", 2),
        ]);
        assert_eq!(groups.len(), 2);
        let h1: Vec<&str> = groups["h1"].iter().map(|r| r.file_name.as_str()).collect();
        assert_eq!(h1, vec!["a.txt", "a-copy.txt"]);
        assert_eq!(groups["h2"].len(), 1);
    }

    #[test]
    fn providers_are_distinct_and_ordered() {
        let results = vec![
            result("a.txt", "h1", 2),
            result("a.txt", "h1", 1),
            result("same-content.txt", "h1", 2),
        ];
        assert_eq!(
            providers_for(&results),
            vec![NodeIdentity::new("localhost", 2), NodeIdentity::new("localhost", 1)]
        );
        assert!(providers_for(&[]).is_empty());
    }

    #[test]
    fn tally_counts_and_formats() {
        let a = NodeIdentity::new("localhost", 8081);
        let b = NodeIdentity::new("localhost", 8082);
        let mut tally = BlockTally::new();
        tally.record(&b);
        tally.record(&a);
        tally.record(&b);
        assert_eq!(tally.count(&a), 1);
        assert_eq!(tally.count(&b), 2);
        assert_eq!(tally.total(), 3);
        assert_eq!(
            tally.to_string(),
            "Provider localhost:8081: 1 blocks\nProvider localhost:8082: 2 blocks\n"
        );
    }
}
