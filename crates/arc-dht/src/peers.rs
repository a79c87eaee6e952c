//! Peer directory.
//!
//! The directory is where a node learns whom it may dial and which key each
//! peer must present. [`FlatFileDirectory`] keeps one peer per line:
//!
//! ```text
//! # transport address public-key-hex
//! tcp 10.0.0.2:11000 3b6a27bcceb6a42d62a3a8d02a6f0d73653215771de243a63ac048a18b59da29
//! socks abcdefgh.onion:11000 d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a
//! ```
//!
//! Blank lines and lines starting with `#` are skipped; malformed lines are
//! logged and skipped.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use arc_crypto::ed25519::{derive_node_id, VerifyingKey};
use arc_types::{NodeId, PeerInfo, TransportKind};
use tracing::{debug, info, warn};

use crate::{DhtError, Result};

/// A directory record: where to reach a peer and the key it must announce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub info: PeerInfo,
    pub public_key: VerifyingKey,
}

impl DirectoryEntry {
    pub fn new(public_key: VerifyingKey, address: impl Into<String>, transport: TransportKind) -> Self {
        let id = NodeId::from_bytes(derive_node_id(&public_key));
        Self {
            info: PeerInfo::new(id, address, transport),
            public_key,
        }
    }

    /// Parse one `<transport> <address> <public-key-hex>` line.
    pub fn parse_line(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let [transport, address, key] = parts.as_slice() else {
            return Err(DhtError::Directory(format!(
                "expected 3 fields, got {}",
                parts.len()
            )));
        };
        let transport: TransportKind = transport
            .parse()
            .map_err(|e: arc_types::TypeError| DhtError::Directory(e.to_string()))?;
        let public_key = VerifyingKey::from_hex(key)?;
        Ok(Self::new(public_key, *address, transport))
    }

    pub fn to_line(&self) -> String {
        format!(
            "{} {} {}",
            self.info.transport,
            self.info.address,
            hex::encode(self.public_key.as_bytes())
        )
    }
}

/// Source of known peers.
pub trait PeerDirectory: Send {
    fn lookup_by_identifier(&self, id: &NodeId) -> Option<DirectoryEntry>;

    fn all_peers(&self) -> Vec<DirectoryEntry>;

    /// Record a peer. Returns `false` if it was already known.
    fn add_peer(&mut self, entry: DirectoryEntry) -> Result<bool>;
}

/// Peers kept in a text file, appended to as new peers are added.
pub struct FlatFileDirectory {
    path: PathBuf,
    entries: Vec<DirectoryEntry>,
}

impl FlatFileDirectory {
    /// Load `path`. A missing file is an empty directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => parse_entries(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "peer file not found, starting empty");
                Vec::new()
            }
            Err(e) => {
                return Err(DhtError::Directory(format!("{}: {e}", path.display())));
            }
        };
        info!(path = %path.display(), peers = entries.len(), "loaded peer directory");
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_entries(text: &str) -> Vec<DirectoryEntry> {
    let mut entries: Vec<DirectoryEntry> = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match DirectoryEntry::parse_line(line) {
            Ok(entry) if entries.iter().any(|e| e.info.id == entry.info.id) => {
                debug!(line = lineno + 1, "duplicate peer entry skipped");
            }
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(line = lineno + 1, error = %e, "skipping malformed peer line"),
        }
    }
    entries
}

impl PeerDirectory for FlatFileDirectory {
    fn lookup_by_identifier(&self, id: &NodeId) -> Option<DirectoryEntry> {
        self.entries.iter().find(|e| e.info.id == *id).cloned()
    }

    fn all_peers(&self) -> Vec<DirectoryEntry> {
        self.entries.clone()
    }

    fn add_peer(&mut self, entry: DirectoryEntry) -> Result<bool> {
        if self.entries.iter().any(|e| e.info.id == entry.info.id) {
            return Ok(false);
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| DhtError::Directory(format!("{}: {e}", self.path.display())))?;
        writeln!(file, "{}", entry.to_line())
            .and_then(|()| file.sync_data())
            .map_err(|e| DhtError::Directory(format!("{}: {e}", self.path.display())))?;
        info!(peer = %entry.info.id.short(), address = %entry.info.address, "peer added to directory");
        self.entries.push(entry);
        Ok(true)
    }
}
