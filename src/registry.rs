//! The set of configured cameras: the JSON store on disk and the live feeds
//! started from it.
//!
//! The store is a plain list of `{hardwareAddress, userName, secret}`
//! objects with credentials written raw. Older files used the keys
//! `mac`/`usuario`/`password` and could hold percent-encoded credentials;
//! only records in that layout are decoded on load.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::FeedError;
use crate::feed::{CameraFeed, FeedContext, FeedId};
use crate::identity::{CameraIdentity, HardwareAddress};

/// One persisted camera.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "StoredRecord")]
pub struct FeedRecord {
    pub hardware_address: String,
    pub user_name: String,
    pub secret: String,
}

/// On-disk layouts a record may come in.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredRecord {
    Current {
        #[serde(rename = "hardwareAddress")]
        hardware_address: String,
        #[serde(rename = "userName")]
        user_name: String,
        secret: String,
    },
    Legacy {
        mac: String,
        usuario: String,
        password: String,
    },
}

impl From<StoredRecord> for FeedRecord {
    fn from(stored: StoredRecord) -> Self {
        match stored {
            StoredRecord::Current {
                hardware_address,
                user_name,
                secret,
            } => Self {
                hardware_address,
                user_name,
                secret,
            },
            StoredRecord::Legacy {
                mac,
                usuario,
                password,
            } => Self {
                hardware_address: mac,
                user_name: decode_if_needed(&usuario).into_owned(),
                secret: decode_if_needed(&password).into_owned(),
            },
        }
    }
}

impl FeedRecord {
    pub fn identity(&self) -> crate::Result<CameraIdentity> {
        CameraIdentity::parse(&self.hardware_address, &self.user_name, &self.secret)
    }
}

impl From<&CameraIdentity> for FeedRecord {
    fn from(identity: &CameraIdentity) -> Self {
        Self {
            hardware_address: identity.hardware_address().canonical(),
            user_name: identity.user().to_string(),
            secret: identity.secret().to_string(),
        }
    }
}

impl fmt::Debug for FeedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedRecord")
            .field("hardware_address", &self.hardware_address)
            .field("user_name", &self.user_name)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Decode `value` when it carries percent escapes that decode to valid
/// UTF-8; otherwise return it unchanged.
pub fn decode_if_needed(value: &str) -> Cow<'_, str> {
    static ESCAPE: OnceLock<Regex> = OnceLock::new();
    let escape = ESCAPE.get_or_init(|| Regex::new(r"%[0-9A-Fa-f]{2}").expect("static regex"));
    if !escape.is_match(value) {
        return Cow::Borrowed(value);
    }
    match urlencoding::decode(value) {
        Ok(decoded) => decoded,
        Err(_) => Cow::Borrowed(value),
    }
}

/// JSON file holding the camera list.
#[derive(Clone, Debug)]
pub struct FeedStore {
    path: PathBuf,
}

impl FeedStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record. A missing file is an empty list; a file that
    /// cannot be parsed, or names an unusable hardware address, is
    /// `ConfigLoadCorrupt`.
    pub fn load(&self) -> crate::Result<Vec<FeedRecord>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("camera store {} not found, starting empty", self.path.display());
                return Ok(Vec::new());
            }
            Err(err) => return Err(FeedError::Io(err)),
        };
        let corrupt = |reason: String| FeedError::ConfigLoadCorrupt {
            path: self.path.clone(),
            reason,
        };
        let records: Vec<FeedRecord> =
            serde_json::from_str(&raw).map_err(|e| corrupt(e.to_string()))?;
        for (index, record) in records.iter().enumerate() {
            record
                .hardware_address
                .parse::<HardwareAddress>()
                .map_err(|e| corrupt(format!("record {index}: {e}")))?;
        }
        Ok(records)
    }

    /// Replace the store with `records`, pretty-printed with four-space
    /// indentation. Writes a sibling file first and renames it over the
    /// store so a crash never leaves a truncated list.
    pub fn save(&self, records: &[FeedRecord]) -> crate::Result<()> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        records
            .serialize(&mut ser)
            .map_err(|e| FeedError::Io(std::io::Error::other(e)))?;
        buf.push(b'\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp_name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "cameras".into());
        tmp_name.push(".tmp");
        let tmp = self.path.with_file_name(tmp_name);
        std::fs::write(&tmp, &buf)?;
        std::fs::rename(&tmp, &self.path)?;
        log::debug!("saved {} camera(s) to {}", records.len(), self.path.display());
        Ok(())
    }
}

/// Live feeds plus the store they persist to.
pub struct FeedRegistry {
    store: FeedStore,
    ctx: FeedContext,
    feeds: Vec<CameraFeed>,
    next_id: u64,
}

impl FeedRegistry {
    /// An empty registry; nothing is read from `store`.
    pub fn new(store: FeedStore, ctx: FeedContext) -> Self {
        Self {
            store,
            ctx,
            feeds: Vec::new(),
            next_id: 1,
        }
    }

    /// Load the store and start one feed per record.
    pub fn restore(store: FeedStore, ctx: FeedContext) -> crate::Result<Self> {
        let records = store.load()?;
        let mut registry = Self::new(store, ctx);
        for record in &records {
            let identity = record.identity()?;
            registry.start(identity)?;
        }
        log::info!(
            "restored {} camera(s) from {}",
            registry.feeds.len(),
            registry.store.path().display()
        );
        Ok(registry)
    }

    /// Start a feed for `identity` and persist the enlarged set. A hardware
    /// address that is already registered is rejected. When the store cannot
    /// be written the new feed is stopped again and the error returned.
    pub fn add(&mut self, identity: CameraIdentity) -> crate::Result<FeedId> {
        let hardware_address = identity.hardware_address();
        if self.find(&hardware_address).is_some() {
            return Err(FeedError::InvalidIdentity(format!(
                "{hardware_address} is already registered"
            )));
        }
        let id = self.start(identity)?;
        if let Err(err) = self.persist() {
            if let Some(mut feed) = self.feeds.pop() {
                feed.shutdown();
            }
            return Err(err);
        }
        Ok(id)
    }

    /// Stop the feed (joining its worker and finalizing any recording),
    /// then persist the reduced set. Returns the removed identity, or `None`
    /// for an unknown id.
    pub fn remove(&mut self, id: FeedId) -> crate::Result<Option<CameraIdentity>> {
        let Some(index) = self.feeds.iter().position(|feed| feed.id() == id) else {
            return Ok(None);
        };
        let mut feed = self.feeds.remove(index);
        feed.shutdown();
        self.persist()?;
        log::info!("{}: removed {}", id, feed.identity().hardware_address());
        Ok(Some(feed.identity().clone()))
    }

    pub fn find(&self, hardware_address: &HardwareAddress) -> Option<FeedId> {
        self.feeds
            .iter()
            .find(|feed| feed.identity().hardware_address() == *hardware_address)
            .map(CameraFeed::id)
    }

    pub fn get(&self, id: FeedId) -> Option<&CameraFeed> {
        self.feeds.iter().find(|feed| feed.id() == id)
    }

    /// Feeds in insertion order.
    pub fn feeds(&self) -> &[CameraFeed] {
        &self.feeds
    }

    pub fn len(&self) -> usize {
        self.feeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }

    pub fn records(&self) -> Vec<FeedRecord> {
        self.feeds
            .iter()
            .map(|feed| FeedRecord::from(feed.identity()))
            .collect()
    }

    pub fn store(&self) -> &FeedStore {
        &self.store
    }

    /// Run the watchdog over every feed; returns the feeds found stale.
    pub fn check_all(&self) -> Vec<(FeedId, FeedError)> {
        self.feeds
            .iter()
            .filter_map(|feed| feed.check_connection().map(|err| (feed.id(), err)))
            .collect()
    }

    /// Write a JPEG of every feed's current frame into `dir`, creating it
    /// if needed. Each feed reports its own outcome.
    pub fn snapshot_all(&self, dir: &Path) -> crate::Result<Vec<(FeedId, crate::Result<PathBuf>)>> {
        std::fs::create_dir_all(dir)?;
        Ok(self
            .feeds
            .iter()
            .map(|feed| (feed.id(), feed.capture_snapshot(dir)))
            .collect())
    }

    /// Stop every feed. All workers are signalled before any is joined.
    pub fn shutdown_all(&mut self) {
        for feed in &self.feeds {
            feed.signal_shutdown();
        }
        for feed in &mut self.feeds {
            feed.shutdown();
        }
    }

    fn start(&mut self, identity: CameraIdentity) -> crate::Result<FeedId> {
        let id = FeedId(self.next_id);
        self.next_id += 1;
        let feed = CameraFeed::spawn(id, identity, &self.ctx)?;
        self.feeds.push(feed);
        Ok(id)
    }

    fn persist(&self) -> crate::Result<()> {
        self.store.save(&self.records())
    }
}

impl Drop for FeedRegistry {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_only_escaped_values() {
        assert_eq!(decode_if_needed("p%40ss%3Aw%2Frd"), "p@ss:w/rd");
        assert_eq!(decode_if_needed("plain"), "plain");
        assert_eq!(decode_if_needed("100%"), "100%");
        assert_eq!(decode_if_needed("50%zz"), "50%zz");
        // Escapes that do not form UTF-8 are kept as written.
        assert_eq!(decode_if_needed("%ff%fe"), "%ff%fe");
    }

    #[test]
    fn debug_hides_secret() {
        let record = FeedRecord {
            hardware_address: "aa:bb:cc:dd:ee:ff".into(),
            user_name: "admin".into(),
            secret: "hunter2".into(),
        };
        let debug = format!("{record:?}");
        assert!(debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn record_from_identity_uses_canonical_address() {
        let identity = CameraIdentity::parse("AA-BB-CC-DD-EE-FF", "admin", "pw").unwrap();
        let record = FeedRecord::from(&identity);
        assert_eq!(record.hardware_address, "aa:bb:cc:dd:ee:ff");
        assert_eq!(record.identity().unwrap(), identity);
    }
}
