//! Base identifiers and partitioned object paths.
//!
//! Every stage writes into a single bucket split into named partitions. Stages
//! never talk to each other; they meet on the same base identifier:
//!
//! ```text
//! uploads/req-1.jpg
//!        │
//!        ▼ base_identifier = "req-1"
//! rekognition-artifacts/req-1 ──▶ polly-artifacts/req-1 ──▶ consolidated/req-1
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Derive the base identifier of an object key.
///
/// Takes the last `/`-separated segment and drops everything from its first
/// `.` onwards. Keys without a separator or without an extension pass through
/// unchanged; an empty key yields an empty identifier.
pub fn base_identifier(key: &str) -> &str {
    let segment = key.rsplit('/').next().unwrap_or(key);
    match segment.find('.') {
        Some(idx) => &segment[..idx],
        None => segment,
    }
}

/// Join a partition prefix and an identifier as `<partition>/<id>`
pub fn partition_path(partition: &str, id: &str) -> String {
    format!("{}/{}", partition, id)
}

/// Logical partitions of the shared bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    /// Raw uploads that start the chain
    Uploads,
    /// Label detection output
    RekognitionArtifacts,
    /// Synthesized speech
    PollyArtifacts,
    /// Sentiment analysis results
    ComprehendArtifacts,
    /// Consolidated summaries
    Consolidated,
}

impl Partition {
    pub const ALL: [Partition; 5] = [
        Partition::Uploads,
        Partition::RekognitionArtifacts,
        Partition::PollyArtifacts,
        Partition::ComprehendArtifacts,
        Partition::Consolidated,
    ];
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Partition::Uploads => "uploads",
            Partition::RekognitionArtifacts => "rekognition-artifacts",
            Partition::PollyArtifacts => "polly-artifacts",
            Partition::ComprehendArtifacts => "comprehend-artifacts",
            Partition::Consolidated => "consolidated",
        };
        f.write_str(name)
    }
}

/// Prefix names for each partition of the bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyspace {
    #[serde(default = "default_uploads")]
    pub uploads: String,
    #[serde(default = "default_rekognition_artifacts")]
    pub rekognition_artifacts: String,
    #[serde(default = "default_polly_artifacts")]
    pub polly_artifacts: String,
    #[serde(default = "default_comprehend_artifacts")]
    pub comprehend_artifacts: String,
    #[serde(default = "default_consolidated")]
    pub consolidated: String,
}

fn default_uploads() -> String {
    Partition::Uploads.to_string()
}

fn default_rekognition_artifacts() -> String {
    Partition::RekognitionArtifacts.to_string()
}

fn default_polly_artifacts() -> String {
    Partition::PollyArtifacts.to_string()
}

fn default_comprehend_artifacts() -> String {
    Partition::ComprehendArtifacts.to_string()
}

fn default_consolidated() -> String {
    Partition::Consolidated.to_string()
}

impl Default for Keyspace {
    fn default() -> Self {
        Self {
            uploads: default_uploads(),
            rekognition_artifacts: default_rekognition_artifacts(),
            polly_artifacts: default_polly_artifacts(),
            comprehend_artifacts: default_comprehend_artifacts(),
            consolidated: default_consolidated(),
        }
    }
}

impl Keyspace {
    /// Prefix configured for a partition
    pub fn prefix(&self, partition: Partition) -> &str {
        match partition {
            Partition::Uploads => &self.uploads,
            Partition::RekognitionArtifacts => &self.rekognition_artifacts,
            Partition::PollyArtifacts => &self.polly_artifacts,
            Partition::ComprehendArtifacts => &self.comprehend_artifacts,
            Partition::Consolidated => &self.consolidated,
        }
    }

    /// `<prefix>/<id>`
    pub fn path(&self, partition: Partition, id: &str) -> String {
        partition_path(self.prefix(partition), id)
    }

    /// `<prefix>/<id>.<ext>`
    pub fn path_with_extension(&self, partition: Partition, id: &str, ext: &str) -> String {
        partition_path(self.prefix(partition), &format!("{}.{}", id, ext))
    }

    /// Partition a key belongs to, judged by its leading path segment
    pub fn partition_of(&self, key: &str) -> Option<Partition> {
        let (head, _) = key.split_once('/')?;
        Partition::ALL
            .into_iter()
            .find(|partition| self.prefix(*partition) == head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_identifier() {
        assert_eq!(base_identifier("uploads/req-1"), "req-1");
        assert_eq!(base_identifier("uploads/req-1.jpg"), "req-1");
        assert_eq!(base_identifier("a/b/c/photo.png"), "photo");
        assert_eq!(base_identifier("photo.png"), "photo");
        assert_eq!(base_identifier("req-1"), "req-1");
    }

    #[test]
    fn test_base_identifier_degenerate_keys() {
        assert_eq!(base_identifier(""), "");
        assert_eq!(base_identifier("uploads/"), "");
        assert_eq!(base_identifier("uploads/.hidden"), "");
        assert_eq!(base_identifier("archive.tar.gz"), "archive");
    }

    #[test]
    fn test_base_identifier_is_stable_across_partitions() {
        let keys = [
            "uploads/req-1",
            "uploads/req-1.jpg",
            "uploads/nested/dir/archive.tar.gz",
            "no-separator.png",
            "",
            "trailing/",
            "uploads/.dotfile",
            "a.b.c/d.e.f",
        ];
        let keyspace = Keyspace::default();

        for key in keys {
            let id = base_identifier(key);
            for partition in Partition::ALL {
                let path = keyspace.path(partition, id);
                assert_eq!(base_identifier(&path), id, "key {key:?} via {partition}");
            }
        }
    }

    #[test]
    fn test_partition_path() {
        assert_eq!(partition_path("consolidated", "req-1"), "consolidated/req-1");
    }

    #[test]
    fn test_keyspace_paths() {
        let keyspace = Keyspace::default();
        assert_eq!(
            keyspace.path(Partition::RekognitionArtifacts, "req-1"),
            "rekognition-artifacts/req-1"
        );
        assert_eq!(
            keyspace.path_with_extension(Partition::ComprehendArtifacts, "abc", "json"),
            "comprehend-artifacts/abc.json"
        );
    }

    #[test]
    fn test_partition_of() {
        let keyspace = Keyspace::default();
        assert_eq!(keyspace.partition_of("uploads/req-1"), Some(Partition::Uploads));
        assert_eq!(
            keyspace.partition_of("polly-artifacts/req-1"),
            Some(Partition::PollyArtifacts)
        );
        assert_eq!(keyspace.partition_of("elsewhere/req-1"), None);
        assert_eq!(keyspace.partition_of("req-1"), None);
    }

    #[test]
    fn test_keyspace_deserialize_defaults() {
        let keyspace: Keyspace = serde_json::from_str(r#"{"uploads": "incoming"}"#).unwrap();
        assert_eq!(keyspace.uploads, "incoming");
        assert_eq!(keyspace.consolidated, "consolidated");
    }
}
