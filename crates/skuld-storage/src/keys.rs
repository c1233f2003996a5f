use crate::types::{MemberKey, ReminderKey};

/// `versions` keyspace: `cluster_utf8`
pub fn version_key(cluster_id: &str) -> Vec<u8> {
    cluster_id.as_bytes().to_vec()
}

/// Prefix for all member rows of one cluster: `len(2) ++ cluster_utf8`.
///
/// The length prefix keeps a scan for cluster "c1" from bleeding into "c10".
pub fn member_prefix(cluster_id: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + cluster_id.len());
    buf.extend_from_slice(&(cluster_id.len() as u16).to_be_bytes());
    buf.extend_from_slice(cluster_id.as_bytes());
    buf
}

/// `members` keyspace: `member_prefix ++ addr_len(1) ++ addr ++ port(4) ++ generation(4)`
pub fn member_key(cluster_id: &str, key: &MemberKey) -> Vec<u8> {
    let mut buf = member_prefix(cluster_id);
    buf.reserve(1 + key.address.len() + 8);
    buf.push(key.address.len() as u8);
    buf.extend_from_slice(&key.address);
    buf.extend_from_slice(&key.port.to_be_bytes());
    buf.extend_from_slice(&key.generation.to_be_bytes());
    buf
}

/// Prefix for all reminders of one grain: `len(2) ++ type_utf8 ++ len(4) ++ key`
pub fn reminder_grain_prefix(grain_type: &str, grain_key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + grain_type.len() + 4 + grain_key.len());
    buf.extend_from_slice(&(grain_type.len() as u16).to_be_bytes());
    buf.extend_from_slice(grain_type.as_bytes());
    buf.extend_from_slice(&(grain_key.len() as u32).to_be_bytes());
    buf.extend_from_slice(grain_key);
    buf
}

/// `reminders` keyspace: `reminder_grain_prefix ++ name_utf8`
pub fn reminder_key(key: &ReminderKey) -> Vec<u8> {
    let mut buf = reminder_grain_prefix(&key.grain_type, &key.grain_key);
    buf.extend_from_slice(key.name.as_bytes());
    buf
}

/// `reminder_hashes` keyspace: `hash(4) ++ reminder_key` → b""
///
/// Big-endian hash first, so a key range scan is a hash range scan. The
/// primary key is recovered from bytes `4..`.
pub fn reminder_hash_key(grain_hash: u32, key: &ReminderKey) -> Vec<u8> {
    let primary = reminder_key(key);
    let mut buf = Vec::with_capacity(4 + primary.len());
    buf.extend_from_slice(&grain_hash.to_be_bytes());
    buf.extend_from_slice(&primary);
    buf
}

/// Inclusive lower bound of the hash index at `grain_hash`.
pub fn hash_range_start(grain_hash: u32) -> Vec<u8> {
    grain_hash.to_be_bytes().to_vec()
}

/// Exclusive upper bound of the hash index past `grain_hash`, or `None` when
/// the range runs to the end of the keyspace.
pub fn hash_range_end(grain_hash: u32) -> Option<Vec<u8>> {
    grain_hash.checked_add(1).map(|h| h.to_be_bytes().to_vec())
}

/// `meta` keyspace: `label_utf8`
pub fn meta_key(label: &str) -> Vec<u8> {
    label.as_bytes().to_vec()
}
