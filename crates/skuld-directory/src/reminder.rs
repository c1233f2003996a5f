use std::time::Duration;

use skuld_storage::QueryBackend;
use skuld_types::query::{output, param};
use skuld_types::{
    check_len, parse_etag, GrainId, Params, Procedure, ReminderEntry, ReminderSnapshot, ResultSet,
    Row, SkuldError, MAX_GRAIN_FIELD_LEN, MAX_NAME_LEN,
};

use crate::shard::ShardSet;
use crate::ReminderTable;

/// [`ReminderTable`] spread over a [`ShardSet`]. Single-grain operations go
/// to the grain's own shard; range reads fan out to all of them.
pub struct ReminderDirectory<B> {
    shards: ShardSet<B>,
}

impl<B: QueryBackend> ReminderDirectory<B> {
    pub fn new(shards: ShardSet<B>) -> Self {
        ReminderDirectory { shards }
    }

    pub fn shards(&self) -> &ShardSet<B> {
        &self.shards
    }
}

fn grain_params(grain_id: &GrainId) -> Params {
    Params::new()
        .bytes(param::GRAIN_KEY, grain_id.key.clone())
        .text(param::GRAIN_TYPE, grain_id.type_tag.clone())
}

fn require_grain(grain_id: &GrainId) -> Result<(), SkuldError> {
    check_len("grain key", grain_id.key.len(), MAX_GRAIN_FIELD_LEN)?;
    check_len("grain type", grain_id.type_tag.len(), MAX_GRAIN_FIELD_LEN)
}

fn require_name(name: &str) -> Result<(), SkuldError> {
    if name.is_empty() {
        return Err(SkuldError::Validation("reminder name must not be empty".into()));
    }
    check_len("reminder name", name.len(), MAX_NAME_LEN)
}

/// A reminder never written carries no etag and stands for version 0.
fn reminder_version(etag: &str) -> Result<i64, SkuldError> {
    if etag.is_empty() {
        Ok(0)
    } else {
        parse_etag(etag)
    }
}

/// Row columns: grain key, grain type, name, start, period (ns), version.
fn decode_reminder(row: &Row) -> Result<ReminderEntry, SkuldError> {
    let period_ns = row.get_i64(4)?;
    let period = u64::try_from(period_ns)
        .map(Duration::from_nanos)
        .map_err(|_| SkuldError::Backend(format!("period column {period_ns} is negative")))?;
    Ok(ReminderEntry {
        grain_id: GrainId::new(row.get_text(1)?, row.get_bytes(0)?),
        name: row.get_text(2)?.to_string(),
        start_at_ns: row.get_timestamp(3)?,
        period,
        etag: row.get_i64(5)?.to_string(),
    })
}

fn decode_set(set: &ResultSet) -> Result<Vec<ReminderEntry>, SkuldError> {
    set.iter().map(decode_reminder).collect()
}

impl<B: QueryBackend> ReminderTable for ReminderDirectory<B> {
    async fn read(&self, grain_id: &GrainId, name: &str) -> Result<ReminderEntry, SkuldError> {
        require_grain(grain_id)?;
        require_name(name)?;
        let (shard_id, backend) = self.shards.route(grain_id);
        let params = grain_params(grain_id).text(param::REMINDER_NAME, name);
        let sets = backend.query(Procedure::ReminderReadRow, params).await.inspect_err(|e| {
            tracing::error!(shard_id, grain = %grain_id, reminder = name, error = %e, "failed to read reminder")
        })?;

        let set = sets.into_iter().next().unwrap_or_default();
        match set.first() {
            Some(row) if !row.is_null(0) => decode_reminder(row).inspect_err(|e| {
                tracing::error!(shard_id, grain = %grain_id, reminder = name, error = %e, "failed to decode reminder")
            }),
            _ => Ok(ReminderEntry::vacant(grain_id.clone())),
        }
    }

    async fn read_all_for_grain(&self, grain_id: &GrainId) -> Result<ReminderSnapshot, SkuldError> {
        require_grain(grain_id)?;
        let (shard_id, backend) = self.shards.route(grain_id);
        let result = async {
            let sets = backend.query(Procedure::ReminderReadRows, grain_params(grain_id)).await?;
            match sets.first() {
                Some(set) => decode_set(set),
                None => Ok(Vec::new()),
            }
        }
        .await
        .inspect_err(|e| {
            tracing::error!(shard_id, grain = %grain_id, error = %e, "failed to read grain reminders")
        })?;
        Ok(ReminderSnapshot::new(result))
    }

    async fn read_range(&self, begin: u32, end: u32) -> Result<ReminderSnapshot, SkuldError> {
        let procedure = if begin <= end {
            Procedure::ReminderReadRange
        } else {
            Procedure::ReminderReadRangeWrapped
        };
        let params = Params::new()
            .big_int(param::BEGIN_HASH, i64::from(begin))
            .big_int(param::END_HASH, i64::from(end));

        let per_shard = self.shards.query_all(procedure, params).await?;
        let mut entries = Vec::new();
        for (shard_id, sets) in per_shard {
            if let Some(set) = sets.first() {
                entries.extend(decode_set(set).inspect_err(|e| {
                    tracing::error!(shard_id, begin, end, error = %e, "failed to decode reminder range")
                })?);
            }
        }
        tracing::debug!(begin, end, count = entries.len(), "read reminder range");
        Ok(ReminderSnapshot::new(entries))
    }

    async fn upsert(&self, entry: &ReminderEntry) -> Result<String, SkuldError> {
        require_grain(&entry.grain_id)?;
        require_name(&entry.name)?;
        if entry.period.is_zero() {
            return Err(SkuldError::Validation(format!(
                "reminder '{}' period must be greater than zero",
                entry.name
            )));
        }
        let period_ns = i64::try_from(entry.period.as_nanos()).map_err(|_| {
            SkuldError::Validation(format!("reminder '{}' period is too large", entry.name))
        })?;
        let old_version = reminder_version(&entry.etag)?;

        let (shard_id, backend) = self.shards.route(&entry.grain_id);
        let params = grain_params(&entry.grain_id)
            .text(param::REMINDER_NAME, entry.name.clone())
            .timestamp(param::START_TIME, entry.start_at_ns)
            .big_int(param::PERIOD, period_ns)
            .big_int(param::GRAIN_HASH, i64::from(entry.grain_id.uniform_hash()))
            .big_int(param::OLD_VERSION, old_version);

        let new_version = backend
            .return_value(Procedure::ReminderUpsert, output::NEW_VERSION, params)
            .await
            .and_then(|v| {
                v.as_i64().ok_or_else(|| {
                    SkuldError::Backend(format!("{} output is {}, expected bigint", output::NEW_VERSION, v.kind()))
                })
            });
        match new_version {
            Ok(v) => Ok(v.to_string()),
            Err(e) if e.is_conflict() => {
                tracing::debug!(shard_id, grain = %entry.grain_id, reminder = %entry.name, etag = %entry.etag, error = %e, "reminder upsert rejected");
                Err(e)
            }
            Err(e) => {
                tracing::error!(shard_id, grain = %entry.grain_id, reminder = %entry.name, etag = %entry.etag, error = %e, "reminder upsert failed");
                Err(e)
            }
        }
    }

    async fn remove(&self, grain_id: &GrainId, name: &str, etag: &str) -> Result<bool, SkuldError> {
        require_grain(grain_id)?;
        require_name(name)?;
        let version = reminder_version(etag)?;
        let (shard_id, backend) = self.shards.route(grain_id);
        let params = grain_params(grain_id)
            .text(param::REMINDER_NAME, name)
            .big_int(param::VERSION, version);
        backend
            .return_value(Procedure::ReminderDelete, output::IS_FOUND, params)
            .await
            .and_then(|v| {
                v.as_bool().ok_or_else(|| {
                    SkuldError::Backend(format!("{} output is {}, expected bool", output::IS_FOUND, v.kind()))
                })
            })
            .inspect_err(|e| {
                tracing::error!(shard_id, grain = %grain_id, reminder = name, etag, error = %e, "failed to remove reminder")
            })
    }

    async fn clear_all(&self) -> Result<(), SkuldError> {
        // Reserved for test harnesses; stored rows are left alone.
        tracing::debug!(shards = self.shards.len(), "clear_all ignored");
        Ok(())
    }
}
