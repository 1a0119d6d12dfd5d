//! Raft type configuration and the replicated command set.

use std::collections::BTreeMap;
use std::io::Cursor;

use serde::Deserialize;
use serde::Serialize;

use crate::error::RegistryError;

pub type NodeId = u64;

openraft::declare_raft_types!(
    /// Type config of the registry's raft group.
    pub TypeConfig:
        D = Command,
        R = CommandResponse,
        NodeId = NodeId,
        Node = openraft::BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
);

/// Derives a raft node id from a cluster address: the first eight bytes of
/// its MD5 digest, big endian. Every member computes the same id for the same
/// address, so membership changes can be expressed by address alone.
pub fn node_id_for(addr: &str) -> NodeId {
    let digest = md5::compute(addr.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.0[..8]);
    u64::from_be_bytes(head)
}

/// One `(bucket, key, value)` write of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    #[serde(with = "b64")]
    pub bucket: Vec<u8>,
    #[serde(with = "b64")]
    pub key: Vec<u8>,
    #[serde(with = "b64")]
    pub value: Vec<u8>,
}

impl Row {
    pub fn new(bucket: impl AsRef<[u8]>, key: impl AsRef<[u8]>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            bucket: bucket.as_ref().to_vec(),
            key: key.as_ref().to_vec(),
            value: value.into(),
        }
    }
}

/// A replicated mutation of the bucket store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "typ", content = "sub", rename_all = "snake_case")]
pub enum Command {
    /// Merge `raft address -> API address` entries into the cluster metadata.
    UpdateApiPeers { peers: BTreeMap<String, String> },
    CreateBucket {
        #[serde(with = "b64")]
        name: Vec<u8>,
        if_not_exist: bool,
    },
    RemoveBucket {
        #[serde(with = "b64")]
        name: Vec<u8>,
    },
    Update {
        #[serde(with = "b64")]
        bucket: Vec<u8>,
        #[serde(with = "b64")]
        key: Vec<u8>,
        #[serde(with = "b64")]
        value: Vec<u8>,
    },
    Batch { rows: Vec<Row> },
}

impl Command {
    /// Buckets whose cached entries become stale once this command commits.
    pub fn touched(&self) -> Vec<(&[u8], Option<&[u8]>)> {
        match self {
            Command::UpdateApiPeers { .. } => Vec::new(),
            Command::CreateBucket { name, .. } | Command::RemoveBucket { name } => vec![(name.as_slice(), None)],
            Command::Update { bucket, key, .. } => vec![(bucket.as_slice(), Some(key.as_slice()))],
            Command::Batch { rows } => rows
                .iter()
                .map(|row| (row.bucket.as_slice(), Some(row.key.as_slice())))
                .collect(),
        }
    }
}

/// Outcome of applying one log entry. Domain failures (missing bucket,
/// duplicate bucket) are part of the replicated result rather than storage
/// faults, so every member reaches the same answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub error: Option<RegistryError>,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self { error: None }
    }

    pub fn failed(error: RegistryError) -> Self {
        Self { error: Some(error) }
    }

    pub fn into_result(self) -> Result<(), RegistryError> {
        match self.error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

/// Serde adapter writing byte fields as standard base64 strings.
pub mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_is_stable() {
        assert_eq!(node_id_for("127.0.0.1:9001"), node_id_for("127.0.0.1:9001"));
        assert_ne!(node_id_for("127.0.0.1:9001"), node_id_for("127.0.0.1:9002"));
    }

    #[test]
    fn test_command_wire_shape() {
        let cmd = Command::Update {
            bucket: b"loda".to_vec(),
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["typ"], "update");
        assert_eq!(json["sub"]["bucket"], "bG9kYQ==");
        let back: Command = serde_json::from_value(json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn test_touched_entries() {
        let cmd = Command::Batch {
            rows: vec![Row::new("a", "k1", b"1".to_vec()), Row::new("b", "k2", b"2".to_vec())],
        };
        let touched = cmd.touched();
        assert_eq!(touched.len(), 2);
        assert_eq!(touched[1], (&b"b"[..], Some(&b"k2"[..])));
        assert!(Command::UpdateApiPeers { peers: BTreeMap::new() }.touched().is_empty());
    }
}
