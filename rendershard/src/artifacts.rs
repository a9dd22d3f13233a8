use std::collections::HashSet;

use shard_protocol::ReceivedArtifact;

/// Artifacts in the order they were first seen, one per filename.
#[derive(Debug, Default, Clone)]
pub struct ArtifactCollector {
    seen: HashSet<String>,
    artifacts: Vec<ReceivedArtifact>,
}

impl ArtifactCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an artifact named `filename` was already collected.
    pub fn contains(&self, filename: &str) -> bool {
        self.seen.contains(filename)
    }

    /// Returns `false` and drops the artifact if its filename was already seen.
    pub fn insert(&mut self, artifact: ReceivedArtifact) -> bool {
        if !self.seen.insert(artifact.filename.clone()) {
            return false;
        }
        self.artifacts.push(artifact);
        true
    }

    pub fn extend(&mut self, artifacts: impl IntoIterator<Item = ReceivedArtifact>) {
        for artifact in artifacts {
            self.insert(artifact);
        }
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn into_vec(self) -> Vec<ReceivedArtifact> {
        self.artifacts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(filename: &str, size: u64) -> ReceivedArtifact {
        ReceivedArtifact {
            filename: filename.to_string(),
            size_in_bytes: size,
            url: format!("memory://b/{filename}"),
            storage_key: filename.to_string(),
        }
    }

    #[test]
    fn test_dedup_by_filename_keeps_first() {
        let mut collector = ArtifactCollector::new();
        assert!(collector.insert(artifact("a.txt", 1)));
        assert!(collector.insert(artifact("b.txt", 2)));
        assert!(!collector.insert(artifact("a.txt", 3)));
        assert!(collector.contains("a.txt"));

        let artifacts = collector.into_vec();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].size_in_bytes, 1);
    }
}
