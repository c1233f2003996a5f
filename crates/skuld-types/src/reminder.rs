use std::fmt;
use std::time::Duration;

/// Typed key of an addressable grain.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct GrainId {
    pub type_tag: String,
    pub key: Vec<u8>,
}

impl GrainId {
    pub fn new(type_tag: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        GrainId { type_tag: type_tag.into(), key: key.into() }
    }

    /// Uniform 32-bit hash used for shard routing and ring ranges.
    ///
    /// CRC-32 over `len(type) ++ type ++ len(key) ++ key`, with big-endian
    /// lengths, so every process computes the same value.
    pub fn uniform_hash(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&(self.type_tag.len() as u32).to_be_bytes());
        hasher.update(self.type_tag.as_bytes());
        hasher.update(&(self.key.len() as u32).to_be_bytes());
        hasher.update(&self.key);
        hasher.finalize()
    }
}

impl fmt::Display for GrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.key) {
            Ok(s) => write!(f, "{}/{}", self.type_tag, s),
            Err(_) => {
                write!(f, "{}/0x", self.type_tag)?;
                for b in &self.key {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// One periodic reminder schedule. Key is `(grain_id, name)`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReminderEntry {
    pub grain_id: GrainId,
    pub name: String,
    pub start_at_ns: i64,
    pub period: Duration,
    /// Per-row version token. Empty for a reminder never written.
    pub etag: String,
}

impl ReminderEntry {
    pub fn new(
        grain_id: GrainId,
        name: impl Into<String>,
        start_at_ns: i64,
        period: Duration,
    ) -> Self {
        ReminderEntry {
            grain_id,
            name: name.into(),
            start_at_ns,
            period,
            etag: String::new(),
        }
    }

    /// Placeholder returned when a lookup finds no row.
    pub fn vacant(grain_id: GrainId) -> Self {
        ReminderEntry {
            grain_id,
            name: String::new(),
            start_at_ns: 0,
            period: Duration::ZERO,
            etag: String::new(),
        }
    }

    pub fn is_vacant(&self) -> bool {
        self.name.is_empty() && self.etag.is_empty()
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = etag.into();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReminderSnapshot {
    pub entries: Vec<ReminderEntry>,
}

impl ReminderSnapshot {
    pub fn new(entries: Vec<ReminderEntry>) -> Self {
        ReminderSnapshot { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReminderEntry> {
        self.entries.iter()
    }

    pub fn find(&self, grain_id: &GrainId, name: &str) -> Option<&ReminderEntry> {
        self.entries.iter().find(|e| &e.grain_id == grain_id && e.name == name)
    }
}

impl IntoIterator for ReminderSnapshot {
    type Item = ReminderEntry;
    type IntoIter = std::vec::IntoIter<ReminderEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
