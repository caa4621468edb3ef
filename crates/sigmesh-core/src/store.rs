//! Node record persistence.
//!
//! Storage is a key/value store of opaque byte blobs keyed by node id.
//! Each record is
//!
//! ```text
//! +-------------+----------------+---------------------+------+
//! | magic (u32) | nodeType (u64) | schemaVersion (u32) | body |
//! +-------------+----------------+---------------------+------+
//! ```
//!
//! big-endian, where the body carries the node's signing key, its policy
//! list and its extension states in registration order. A magic mismatch
//! or an unknown node/extension type is a fatal load error.
//!
//! Two backends exist behind one dispatch enum: in-process memory for
//! tests and demos, and a file-per-node directory with owner-only
//! permissions. Writes of a single node are serialized by that node's run
//! loop; the store itself only needs to be safe for concurrent readers.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;

use crate::config::StorageConfig;
use crate::crypto::{NodeId, NodeKey};
use crate::ext::{ext_kind_for, ExtKind};
use crate::policy::Policy;
use crate::types::NodeType;
use crate::wire::{value_tags, SerializedValue, ValueReader, ValueWriter, WireError};

/// Magic prefix of every stored node record.
pub const RECORD_MAGIC: u32 = 0x2491_df14;

/// Current record schema version.
pub const RECORD_SCHEMA_VERSION: u32 = 1;

/// Size of the record header (magic + node type + schema version).
pub const RECORD_HEADER_LEN: usize = 4 + 8 + 4;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O failure in the directory backend.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The storage directory is readable by other users.
    #[error("insecure permissions on storage directory: {path}")]
    InsecurePermissions {
        /// The offending path.
        path: String,
    },

    /// The record header was shorter than [`RECORD_HEADER_LEN`].
    #[error("record header truncated: {found}/{RECORD_HEADER_LEN} bytes")]
    TruncatedHeader {
        /// Bytes present.
        found: usize,
    },

    /// The record magic did not match.
    #[error("record magic mismatch: {found:#010x}")]
    BadMagic {
        /// The magic value found.
        found: u32,
    },

    /// The record schema version is not supported.
    #[error("unsupported record schema version {found}")]
    UnsupportedVersion {
        /// The version found.
        found: u32,
    },

    /// The record body failed to decode.
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// A decoded node record.
pub struct NodeRecord {
    /// The node's type.
    pub node_type: NodeType,
    /// The node's signing key.
    pub key: NodeKey,
    /// The node's policy list.
    pub policies: Vec<Policy>,
    /// Extension states in registration (dispatch) order.
    pub extensions: Vec<(ExtKind, SerializedValue)>,
}

impl NodeRecord {
    /// Encodes the record to its storage bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let t = value_tags();
        let mut w = ValueWriter::new();
        w.push_secret_key(&self.key.secret_bytes());
        w.tag(t.vec);
        w.tag(t.value);
        w.raw_u64(self.policies.len() as u64);
        for policy in &self.policies {
            w.raw_value(&policy.to_value());
        }
        w.tag(t.vec);
        w.tag(t.u64_);
        w.tag(t.value);
        w.raw_u64(self.extensions.len() as u64);
        for (kind, state) in &self.extensions {
            w.raw_u64(kind.ext_type().raw());
            w.raw_value(state);
        }
        let body = w.finish().marshal();

        let mut out = Vec::with_capacity(RECORD_HEADER_LEN + body.len());
        out.extend_from_slice(&RECORD_MAGIC.to_be_bytes());
        out.extend_from_slice(&self.node_type.raw().to_be_bytes());
        out.extend_from_slice(&RECORD_SCHEMA_VERSION.to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Decodes a record from its storage bytes.
    ///
    /// # Errors
    ///
    /// Magic, version, truncation and body decode failures are all fatal;
    /// an extension type that is not registered fails with
    /// [`WireError::UnknownExtType`].
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() < RECORD_HEADER_LEN {
            return Err(StoreError::TruncatedHeader { found: bytes.len() });
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        let magic = u32::from_be_bytes(magic);
        if magic != RECORD_MAGIC {
            return Err(StoreError::BadMagic { found: magic });
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[4..12]);
        let node_type = NodeType(u64::from_be_bytes(word));
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[12..16]);
        let version = u32::from_be_bytes(version);
        if version != RECORD_SCHEMA_VERSION {
            return Err(StoreError::UnsupportedVersion { found: version });
        }

        let (value, rest) = SerializedValue::parse(&bytes[RECORD_HEADER_LEN..])?;
        if !rest.is_empty() {
            return Err(WireError::Trailing {
                types: 0,
                bytes: rest.len(),
            }
            .into());
        }

        let t = value_tags();
        let mut r = ValueReader::new(&value);
        let key = NodeKey::from_secret_bytes(&r.take_secret_key("record key")?);

        r.expect_tag(t.vec, "record policies")?;
        r.expect_tag(t.value, "record policies")?;
        let policy_count = r.raw_u64("record policies")? as usize;
        let mut policies = Vec::new();
        for _ in 0..policy_count {
            let nested = r.raw_value("record policy")?;
            policies.push(Policy::from_value(&nested)?);
        }

        r.expect_tag(t.vec, "record extensions")?;
        r.expect_tag(t.u64_, "record extensions")?;
        r.expect_tag(t.value, "record extensions")?;
        let ext_count = r.raw_u64("record extensions")? as usize;
        let mut extensions = Vec::new();
        for _ in 0..ext_count {
            let type_hash = r.raw_u64("record extension type")?;
            let kind = ext_kind_for(type_hash).ok_or(WireError::UnknownExtType(type_hash))?;
            let state = r.raw_value("record extension state")?;
            extensions.push((kind, state));
        }
        r.finish().map_err(WireError::from)?;

        Ok(Self {
            node_type,
            key,
            policies,
            extensions,
        })
    }
}

/// Node record storage, dispatching to the configured backend.
#[derive(Debug)]
pub enum NodeStore {
    /// In-process map.
    Memory(MemoryStore),
    /// File-per-node directory.
    Dir(DirStore),
}

impl NodeStore {
    /// Opens the backend selected by `config`.
    ///
    /// # Errors
    ///
    /// Directory creation or permission failures for the directory backend.
    pub fn open(config: &StorageConfig) -> Result<Self, StoreError> {
        match config {
            StorageConfig::Memory => Ok(Self::Memory(MemoryStore::default())),
            StorageConfig::Dir(path) => Ok(Self::Dir(DirStore::open(path)?)),
        }
    }

    /// Reads the record bytes for `id`, if present.
    ///
    /// # Errors
    ///
    /// Backend I/O failures.
    pub fn read(&self, id: NodeId) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Self::Memory(store) => Ok(store.read(id)),
            Self::Dir(store) => store.read(id),
        }
    }

    /// Writes the record bytes for `id`, replacing any previous record.
    ///
    /// # Errors
    ///
    /// Backend I/O failures.
    pub fn write(&self, id: NodeId, bytes: &[u8]) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => {
                store.write(id, bytes);
                Ok(())
            }
            Self::Dir(store) => store.write(id, bytes),
        }
    }
}

/// In-process record store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<NodeId, Vec<u8>>>,
}

impl MemoryStore {
    fn read(&self, id: NodeId) -> Option<Vec<u8>> {
        self.records
            .read()
            .expect("store lock poisoned")
            .get(&id)
            .cloned()
    }

    fn write(&self, id: NodeId, bytes: &[u8]) {
        self.records
            .write()
            .expect("store lock poisoned")
            .insert(id, bytes.to_vec());
    }
}

/// File-per-node record store with owner-only permissions.
#[derive(Debug)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    fn open(root: &Path) -> Result<Self, StoreError> {
        if !root.exists() {
            fs::create_dir_all(root)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(root, fs::Permissions::from_mode(0o700))?;
            }
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(root)?.permissions().mode();
            if mode & 0o077 != 0 {
                return Err(StoreError::InsecurePermissions {
                    path: root.display().to_string(),
                });
            }
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn record_path(&self, id: NodeId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn read(&self, id: NodeId) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.record_path(id);
        match fs::File::open(&path) {
            Ok(mut file) => {
                let mut bytes = Vec::new();
                file.read_to_end(&mut bytes)?;
                Ok(Some(bytes))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, id: NodeId, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.record_path(id);
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeKey;
    use crate::ext::{ExtensionSlot, GroupExt, LockableExt};
    use crate::policy::Tree;

    fn sample_record() -> NodeRecord {
        let key = NodeKey::generate();
        let lockable = LockableExt::new([NodeKey::generate().node_id()]);
        let group = GroupExt::new([(NodeKey::generate().node_id(), "crew".to_string())]);
        NodeRecord {
            node_type: NodeType::new("TEST"),
            key,
            policies: vec![
                Policy::AllNodes(Tree::leaf()),
                Policy::DefaultAcl,
            ],
            extensions: vec![
                (ExtKind::Lockable, ExtensionSlot::Lockable(lockable).to_value()),
                (ExtKind::Group, ExtensionSlot::Group(group).to_value()),
            ],
        }
    }

    #[test]
    fn record_round_trips() {
        let record = sample_record();
        let decoded = NodeRecord::decode(&record.encode()).expect("decode record");
        assert_eq!(decoded.node_type, record.node_type);
        assert_eq!(decoded.key.node_id(), record.key.node_id());
        assert_eq!(decoded.policies, record.policies);
        assert_eq!(decoded.extensions.len(), 2);
        assert_eq!(decoded.extensions[0].0, ExtKind::Lockable);
        assert_eq!(decoded.extensions[1].0, ExtKind::Group);
        assert_eq!(decoded.extensions[0].1, record.extensions[0].1);
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut bytes = sample_record().encode();
        bytes[0] ^= 0xff;
        assert!(matches!(
            NodeRecord::decode(&bytes),
            Err(StoreError::BadMagic { .. })
        ));
    }

    #[test]
    fn unsupported_version_is_fatal() {
        let mut bytes = sample_record().encode();
        bytes[12..16].copy_from_slice(&99u32.to_be_bytes());
        assert!(matches!(
            NodeRecord::decode(&bytes),
            Err(StoreError::UnsupportedVersion { found: 99 })
        ));
    }

    #[test]
    fn truncated_header_is_fatal() {
        let bytes = sample_record().encode();
        assert!(matches!(
            NodeRecord::decode(&bytes[..10]),
            Err(StoreError::TruncatedHeader { .. })
        ));
    }

    #[test]
    fn unknown_extension_type_is_fatal() {
        let record = NodeRecord {
            extensions: vec![(ExtKind::Listener, {
                let mut w = ValueWriter::new();
                w.push_u64(4);
                w.finish()
            })],
            ..sample_record()
        };
        let mut bytes = record.encode();
        // Corrupt the extension type hash inside the body; find it by
        // re-encoding with a poisoned kind is not possible, so flip a byte
        // of the known hash value instead.
        let needle = ExtKind::Listener.ext_type().raw().to_be_bytes();
        let pos = bytes
            .windows(8)
            .position(|window| window == needle)
            .expect("extension type present");
        bytes[pos] ^= 0xff;
        assert!(matches!(
            NodeRecord::decode(&bytes),
            Err(StoreError::Wire(WireError::UnknownExtType(_)))
        ));
    }

    #[test]
    fn memory_store_round_trips() {
        let store = NodeStore::open(&StorageConfig::Memory).expect("open memory store");
        let id = NodeKey::generate().node_id();
        assert!(store.read(id).expect("read").is_none());
        store.write(id, b"record").expect("write");
        assert_eq!(store.read(id).expect("read").as_deref(), Some(&b"record"[..]));
    }

    #[test]
    fn dir_store_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store =
            NodeStore::open(&StorageConfig::Dir(dir.path().join("nodes"))).expect("open dir store");
        let id = NodeKey::generate().node_id();
        assert!(store.read(id).expect("read").is_none());
        store.write(id, b"record").expect("write");
        assert_eq!(store.read(id).expect("read").as_deref(), Some(&b"record"[..]));

        // Overwrite replaces.
        store.write(id, b"newer").expect("rewrite");
        assert_eq!(store.read(id).expect("read").as_deref(), Some(&b"newer"[..]));
    }

    #[cfg(unix)]
    #[test]
    fn dir_store_rejects_loose_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nodes");
        fs::create_dir_all(&path).expect("mkdir");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        assert!(matches!(
            NodeStore::open(&StorageConfig::Dir(path)),
            Err(StoreError::InsecurePermissions { .. })
        ));
    }
}
