//! Comparison of checksum records held by independent copies.
//!
//! One source is the master; every other source is a peer compared against it
//! independently. A path divergent against one peer and consistent against
//! another keeps both statuses.

use crate::checksums::{digests_match, ChecksumAlgorithm};
use crate::error::EngineError;
use crate::manifest::Manifest;
use crate::tree;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use tracing::debug;

/// How one peer relates to the master for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerStatus {
    Consistent,
    Divergent { master: String, peer: String },
    MissingInPeer,
    /// Present in the peer, absent from the master
    ExtraInPeer { peer: String },
    Unreadable(String),
}

impl PeerStatus {
    pub fn category(&self) -> &'static str {
        match self {
            PeerStatus::Consistent => "matched",
            PeerStatus::Divergent { .. } => "unmatched",
            PeerStatus::MissingInPeer => "missing",
            PeerStatus::ExtraInPeer { .. } => "extra",
            PeerStatus::Unreadable(_) => "oserror",
        }
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerStatus::Consistent => f.write_str("matched"),
            PeerStatus::Divergent { master, peer } => {
                write!(f, "unmatched (master {}, peer {})", master, peer)
            }
            PeerStatus::MissingInPeer => f.write_str("missing"),
            PeerStatus::ExtraInPeer { .. } => f.write_str("extra"),
            PeerStatus::Unreadable(reason) => write!(f, "unreadable ({})", reason),
        }
    }
}

/// Comparison result for one relative path across all peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonRecord {
    pub relative_path: String,
    pub master_checksum: Option<String>,
    /// Peer label -> checksum recorded by that peer, if any.
    ///
    /// The label is the peer id, suffixed with the peer's position when
    /// several peers share an id.
    pub peer_checksums: BTreeMap<String, Option<String>>,
    /// Peer label -> status against the master
    pub statuses: BTreeMap<String, PeerStatus>,
}

impl ComparisonRecord {
    /// True when every peer agrees with the master.
    pub fn is_consistent(&self) -> bool {
        self.statuses.values().all(|s| *s == PeerStatus::Consistent)
    }

    /// One category per distinct non-matching status, or `matched`.
    pub fn categories(&self) -> Vec<&'static str> {
        let problems: BTreeSet<&'static str> = self
            .statuses
            .values()
            .filter(|s| **s != PeerStatus::Consistent)
            .map(PeerStatus::category)
            .collect();
        if problems.is_empty() {
            vec!["matched"]
        } else {
            problems.into_iter().collect()
        }
    }

    pub fn describe_peers(&self) -> String {
        self.statuses
            .iter()
            .map(|(peer, status)| format!("{}: {}", peer, status))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Checksums loaded from one tree or manifest.
#[derive(Debug, Clone, Default)]
pub struct ChecksumSource {
    /// Identifier used in reports (the tree root or manifest path)
    pub id: String,
    /// Key -> lowercase checksum
    pub entries: BTreeMap<String, String>,
    /// Key -> reason, for records that exist but could not be read
    pub unreadable: BTreeMap<String, String>,
    /// Algorithm declared by a manifest header
    pub algorithm: Option<ChecksumAlgorithm>,
}

impl ChecksumSource {
    pub fn from_entries(id: impl Into<String>, entries: BTreeMap<String, String>) -> Self {
        ChecksumSource {
            id: id.into(),
            entries,
            unreadable: BTreeMap::new(),
            algorithm: None,
        }
    }

    /// Load every sidecar beneath a checksum tree.
    ///
    /// Keys are sidecar paths relative to the root (`a/b.tif.sha256`), so trees
    /// holding several algorithms compare like with like.
    pub fn from_tree(root: &Path, recursive: bool) -> Result<Self, EngineError> {
        let mut source = ChecksumSource {
            id: root.display().to_string(),
            ..ChecksumSource::default()
        };
        for sidecar in tree::scan_sidecars(root, recursive)? {
            let key = format!("{}.{}", sidecar.relative_path, sidecar.algorithm);
            match tree::read_sidecar(&sidecar.path, &sidecar.relative_path, sidecar.algorithm) {
                Ok(record) => {
                    source.entries.insert(key, record.checksum);
                }
                Err(e) => {
                    debug!(path = %sidecar.path.display(), error = %e, "unreadable sidecar");
                    source.unreadable.insert(key, e.detailed());
                }
            }
        }
        Ok(source)
    }

    /// Load every entry of a manifest.
    pub fn from_manifest(path: &Path) -> Result<Self, EngineError> {
        let contents = Manifest::new(path).read_all()?;
        let mut source = ChecksumSource::from_entries(path.display().to_string(), contents.entries);
        source.algorithm = contents.algorithm;
        Ok(source)
    }

    fn lookup(&self, key: &str) -> Option<Result<&str, &str>> {
        if let Some(reason) = self.unreadable.get(key) {
            return Some(Err(reason.as_str()));
        }
        self.entries.get(key).map(|c| Ok(c.as_str()))
    }
}

/// Compare `master` against each peer over the union of all keys.
///
/// For a key the master lacks, peers that also lack it are left out of the
/// record rather than reported missing.
pub fn compare(master: &ChecksumSource, peers: &[ChecksumSource]) -> Vec<ComparisonRecord> {
    let mut keys: BTreeSet<&str> = master
        .entries
        .keys()
        .chain(master.unreadable.keys())
        .map(String::as_str)
        .collect();
    for peer in peers {
        keys.extend(peer.entries.keys().chain(peer.unreadable.keys()).map(String::as_str));
    }

    let labels = peer_labels(peers);
    keys.into_iter()
        .map(|key| {
            let lookups = peers
                .iter()
                .zip(&labels)
                .map(|(peer, label)| (label.as_str(), peer.lookup(key)));
            compare_key(key, master.lookup(key), lookups)
        })
        .collect()
}

/// One distinct label per peer: the id, or `id [peer N]` when ids repeat.
fn peer_labels(peers: &[ChecksumSource]) -> Vec<String> {
    peers
        .iter()
        .enumerate()
        .map(|(index, peer)| {
            if peers.iter().filter(|other| other.id == peer.id).count() > 1 {
                format!("{} [peer {}]", peer.id, index + 1)
            } else {
                peer.id.clone()
            }
        })
        .collect()
}

fn compare_key<'a>(
    key: &str,
    master: Option<Result<&str, &str>>,
    peers: impl Iterator<Item = (&'a str, Option<Result<&'a str, &'a str>>)>,
) -> ComparisonRecord {
    let mut record = ComparisonRecord {
        relative_path: key.to_string(),
        master_checksum: match master {
            Some(Ok(checksum)) => Some(checksum.to_string()),
            _ => None,
        },
        peer_checksums: BTreeMap::new(),
        statuses: BTreeMap::new(),
    };

    for (peer_id, peer) in peers {
        let peer_checksum = match peer {
            Some(Ok(checksum)) => Some(checksum.to_string()),
            _ => None,
        };
        let status = match (master, peer) {
            (Some(Err(reason)), _) => PeerStatus::Unreadable(reason.to_string()),
            (_, Some(Err(reason))) => PeerStatus::Unreadable(reason.to_string()),
            (Some(Ok(m)), Some(Ok(p))) if digests_match(m, p) => PeerStatus::Consistent,
            (Some(Ok(m)), Some(Ok(p))) => PeerStatus::Divergent {
                master: m.to_string(),
                peer: p.to_string(),
            },
            (Some(Ok(_)), None) => PeerStatus::MissingInPeer,
            (None, Some(Ok(p))) => PeerStatus::ExtraInPeer { peer: p.to_string() },
            (None, None) => continue,
        };
        record.peer_checksums.insert(peer_id.to_string(), peer_checksum);
        record.statuses.insert(peer_id.to_string(), status);
    }

    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileRecord;
    use crate::tree::ChecksumTree;

    fn source(id: &str, entries: &[(&str, &str)]) -> ChecksumSource {
        ChecksumSource::from_entries(
            id,
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_divergent_and_extra_in_peer() {
        let master = source("master", &[("a", "x")]);
        let peer = source("peer", &[("a", "y"), ("b", "z")]);

        let records = compare(&master, &[peer]);
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].relative_path, "a");
        assert_eq!(
            records[0].statuses["peer"],
            PeerStatus::Divergent {
                master: "x".to_string(),
                peer: "y".to_string()
            }
        );
        assert_eq!(records[1].relative_path, "b");
        assert_eq!(records[1].statuses["peer"], PeerStatus::ExtraInPeer { peer: "z".to_string() });
        assert_eq!(records[1].master_checksum, None);
    }

    #[test]
    fn test_peers_are_compared_independently() {
        let master = source("master", &[("a", "AA")]);
        let p1 = source("p1", &[("a", "aa")]);
        let p2 = source("p2", &[("a", "bb")]);
        let p3 = source("p3", &[]);

        let records = compare(&master, &[p1, p2, p3]);
        let record = &records[0];
        assert_eq!(record.statuses["p1"], PeerStatus::Consistent);
        assert!(matches!(record.statuses["p2"], PeerStatus::Divergent { .. }));
        assert_eq!(record.statuses["p3"], PeerStatus::MissingInPeer);
        assert_eq!(record.categories(), vec!["missing", "unmatched"]);
        assert!(!record.is_consistent());
    }

    #[test]
    fn test_extra_path_omits_peers_without_it() {
        let master = source("master", &[]);
        let p1 = source("p1", &[("b", "1")]);
        let p2 = source("p2", &[]);

        let records = compare(&master, &[p1, p2]);
        assert_eq!(records.len(), 1);
        assert!(!records[0].statuses.contains_key("p2"));
    }

    #[test]
    fn test_consistent_record_category() {
        let master = source("master", &[("a", "1")]);
        let peer = source("peer", &[("a", "1")]);
        let records = compare(&master, &[peer]);
        assert_eq!(records[0].categories(), vec!["matched"]);
        assert!(records[0].is_consistent());
    }

    #[test]
    fn test_unreadable_master_marks_every_peer() {
        let mut master = source("master", &[]);
        master.unreadable.insert("a".to_string(), "permission denied".to_string());
        let p1 = source("p1", &[("a", "1")]);
        let p2 = source("p2", &[]);

        let records = compare(&master, &[p1, p2]);
        assert!(matches!(records[0].statuses["p1"], PeerStatus::Unreadable(_)));
        assert!(matches!(records[0].statuses["p2"], PeerStatus::Unreadable(_)));
        assert_eq!(records[0].categories(), vec!["oserror"]);
    }

    #[test]
    fn test_peers_sharing_an_id_are_kept_apart() {
        let master = source("master", &[("a", "1")]);
        let first = source("copy", &[("a", "1")]);
        let second = source("copy", &[("a", "2")]);

        let records = compare(&master, &[first, second]);
        let record = &records[0];
        assert_eq!(record.statuses.len(), 2);
        assert_eq!(record.statuses["copy [peer 1]"], PeerStatus::Consistent);
        assert!(matches!(record.statuses["copy [peer 2]"], PeerStatus::Divergent { .. }));
        assert_eq!(record.peer_checksums["copy [peer 2]"], Some("2".to_string()));
        assert_eq!(record.categories(), vec!["unmatched"]);
    }

    #[test]
    fn test_compare_loaded_trees() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let master_root = temp_dir.path().join("master");
        let peer_root = temp_dir.path().join("peer");
        let record = FileRecord::new("d/a.txt", ChecksumAlgorithm::Md5, "0a", None);
        ChecksumTree::new(&master_root, ChecksumAlgorithm::Md5)
            .write(&record)
            .expect("Failed to write master");
        ChecksumTree::new(&peer_root, ChecksumAlgorithm::Md5)
            .write(&FileRecord::new("d/a.txt", ChecksumAlgorithm::Md5, "0b", None))
            .expect("Failed to write peer");

        let master = ChecksumSource::from_tree(&master_root, true).expect("Failed to load master");
        assert_eq!(master.entries.get("d/a.txt.md5").map(String::as_str), Some("0a"));

        let peer = ChecksumSource::from_tree(&peer_root, true).expect("Failed to load peer");
        let records = compare(&master, &[peer]);
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0].statuses.values().next(), Some(PeerStatus::Divergent { .. })));
    }
}
