//! Procedure engine shared by every backend.
//!
//! Each procedure reads through a [`RowStore`] and returns its [`Outcome`]
//! together with the row writes it wants. The backend holds its lock across
//! the read and the apply, which makes every call all-or-nothing.

use skuld_types::query::{output, param};
use skuld_types::{NodeStatus, Outcome, Params, Procedure, ResultSet, Row, SkuldError, Value};

use crate::traits::RowStore;
use crate::types::{MemberKey, MemberRow, Mutation, ReminderKey, ReminderRow, SuspectRow, VersionRow};

type Executed = Result<(Outcome, Vec<Mutation>), SkuldError>;

pub fn execute<S: RowStore + ?Sized>(store: &S, procedure: Procedure, params: &Params) -> Executed {
    match procedure {
        Procedure::MembershipInsertVersion => insert_version(store, params),
        Procedure::MembershipInsert => insert_member(store, params),
        Procedure::MembershipUpdate => update_member(store, params),
        Procedure::MembershipReadAll => read_all_members(store, params),
        Procedure::MembershipReadRow => read_member_row(store, params),
        Procedure::MembershipUpdateHeartbeat => update_heartbeat(store, params),
        Procedure::MembershipDeleteCluster => delete_cluster(store, params),
        Procedure::MembershipDeleteDefunct => delete_defunct(store, params),
        Procedure::MembershipGateways => read_gateways(store, params),
        Procedure::ReminderReadRow => read_reminder_row(store, params),
        Procedure::ReminderReadRows => read_reminder_rows(store, params),
        Procedure::ReminderReadRange => read_reminder_range(store, params, false),
        Procedure::ReminderReadRangeWrapped => read_reminder_range(store, params, true),
        Procedure::ReminderUpsert => upsert_reminder(store, params),
        Procedure::ReminderDelete => delete_reminder(store, params),
    }
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

fn member_key(params: &Params) -> Result<MemberKey, SkuldError> {
    Ok(MemberKey {
        address: params.require_bytes(param::ADDRESS)?.to_vec(),
        port: params.require_i32(param::PORT)?,
        generation: params.require_i32(param::GENERATION)?,
    })
}

fn suspect_rows(params: &Params) -> Result<Vec<SuspectRow>, SkuldError> {
    params
        .require_table(param::SUSPECT_TIMES)?
        .iter()
        .map(|row| {
            Ok(SuspectRow {
                address: row.get_bytes(0)?.to_vec(),
                port: row.get_i32(1)?,
                generation: row.get_i32(2)?,
                at_ns: row.get_timestamp(3)?,
            })
        })
        .collect()
}

fn expected_matches(current: &VersionRow, params: &Params) -> Result<bool, SkuldError> {
    Ok(current.etag_no == params.require_i64(param::ETAG_NO)?
        && current.version == params.require_i64(param::VERSION)?)
}

fn advance(current: &VersionRow) -> VersionRow {
    VersionRow {
        cluster_id: current.cluster_id.clone(),
        version: current.version + 1,
        etag_no: current.etag_no + 1,
    }
}

/// Re-stamps every other member of the cluster with the new version etag so
/// row etags keep agreeing with the version row.
fn restamp_others<S: RowStore + ?Sized>(
    store: &S,
    cluster_id: &str,
    next: &VersionRow,
    written: &MemberKey,
) -> Result<Vec<Mutation>, SkuldError> {
    Ok(store
        .member_rows(cluster_id)?
        .into_iter()
        .filter(|m| &m.key != written)
        .map(|mut m| {
            m.etag_no = next.etag_no;
            Mutation::PutMember(m)
        })
        .collect())
}

fn insert_version<S: RowStore + ?Sized>(store: &S, params: &Params) -> Executed {
    let cluster_id = params.require_text(param::CLUSTER_ID)?;
    if store.version_row(cluster_id)?.is_some() {
        return Ok((Outcome::none(), Vec::new()));
    }
    let row = VersionRow {
        cluster_id: cluster_id.to_string(),
        version: params.require_i64(param::VERSION)?,
        etag_no: params.require_i64(param::ETAG_NO)?,
    };
    Ok((Outcome::none(), vec![Mutation::PutVersion(row)]))
}

fn insert_member<S: RowStore + ?Sized>(store: &S, params: &Params) -> Executed {
    let cluster_id = params.require_text(param::CLUSTER_ID)?;
    let key = member_key(params)?;
    let current = store.version_row(cluster_id)?.ok_or_else(|| {
        SkuldError::NotFound(format!("version row for cluster '{cluster_id}'"))
    })?;
    if !expected_matches(&current, params)? {
        return Err(SkuldError::Conflict(format!(
            "table version is <{}, {}>, caller expected <{}, {}>",
            current.version,
            current.etag_no,
            params.require_i64(param::VERSION)?,
            params.require_i64(param::ETAG_NO)?,
        )));
    }
    if store.member_row(cluster_id, &key)?.is_some() {
        return Err(SkuldError::Conflict("member row already exists".into()));
    }

    let next = advance(&current);
    let member_id = store.next_member_id()?;
    let row = MemberRow {
        member_id,
        cluster_id: cluster_id.to_string(),
        key: key.clone(),
        name: params.require_text(param::NAME)?.to_string(),
        host: params.require_text(param::HOST)?.to_string(),
        status: params.require_i16(param::STATUS)?,
        proxy_port: params.require_i32(param::PROXY_PORT)?,
        start_time_ns: params.require_timestamp(param::START_TIME)?,
        heartbeat_ns: params.require_timestamp(param::HEARTBEAT_TIME)?,
        etag_no: next.etag_no,
        version: next.version,
        suspects: suspect_rows(params)?,
    };

    let mut mutations = restamp_others(store, cluster_id, &next, &key)?;
    mutations.push(Mutation::PutMember(row));
    mutations.push(Mutation::PutVersion(next));
    mutations.push(Mutation::SetNextMemberId(member_id + 1));
    Ok((Outcome::none(), mutations))
}

fn not_updated() -> Executed {
    Ok((Outcome::none().with_output(output::UPDATED, Value::Bool(false)), Vec::new()))
}

fn update_member<S: RowStore + ?Sized>(store: &S, params: &Params) -> Executed {
    let cluster_id = params.require_text(param::CLUSTER_ID)?;
    let key = member_key(params)?;
    let Some(current) = store.version_row(cluster_id)? else {
        return not_updated();
    };
    if !expected_matches(&current, params)? {
        return not_updated();
    }
    let Some(existing) = store.member_row(cluster_id, &key)? else {
        return not_updated();
    };
    if existing.etag_no != params.require_i64(param::ROW_ETAG_NO)? {
        return not_updated();
    }

    let next = advance(&current);
    // Full replacement, suspect list included.
    let row = MemberRow {
        member_id: existing.member_id,
        cluster_id: existing.cluster_id,
        key: key.clone(),
        name: params.require_text(param::NAME)?.to_string(),
        host: params.require_text(param::HOST)?.to_string(),
        status: params.require_i16(param::STATUS)?,
        proxy_port: params.require_i32(param::PROXY_PORT)?,
        start_time_ns: params.require_timestamp(param::START_TIME)?,
        heartbeat_ns: params.require_timestamp(param::HEARTBEAT_TIME)?,
        etag_no: next.etag_no,
        version: next.version,
        suspects: suspect_rows(params)?,
    };

    let mut mutations = restamp_others(store, cluster_id, &next, &key)?;
    mutations.push(Mutation::PutMember(row));
    mutations.push(Mutation::PutVersion(next));
    Ok((Outcome::none().with_output(output::UPDATED, Value::Bool(true)), mutations))
}

fn read_all_members<S: RowStore + ?Sized>(store: &S, params: &Params) -> Executed {
    let cluster_id = params.require_text(param::CLUSTER_ID)?;
    let Some(version) = store.version_row(cluster_id)? else {
        return Ok((Outcome::none().with_set(ResultSet::default()), Vec::new()));
    };
    let mut members = store.member_rows(cluster_id)?;
    members.sort_by_key(|m| m.member_id);

    let version_set = ResultSet::new(vec![Row::new(vec![
        Value::Text(version.cluster_id.clone()),
        Value::BigInt(version.etag_no),
        Value::BigInt(version.version),
    ])]);
    let member_set = ResultSet::new(
        members
            .iter()
            .map(|m| {
                Row::new(vec![
                    Value::BigInt(m.member_id),
                    Value::Bytes(m.key.address.clone()),
                    Value::Int(m.key.port),
                    Value::Int(m.key.generation),
                    Value::Text(m.name.clone()),
                    Value::Text(m.host.clone()),
                    Value::SmallInt(m.status),
                    Value::Int(m.proxy_port),
                    Value::Timestamp(m.start_time_ns),
                    Value::Timestamp(m.heartbeat_ns),
                    Value::BigInt(m.etag_no),
                    Value::BigInt(m.version),
                ])
            })
            .collect(),
    );
    let suspect_set = ResultSet::new(
        members
            .iter()
            .flat_map(|m| {
                m.suspects.iter().map(move |s| {
                    Row::new(vec![
                        Value::BigInt(m.member_id),
                        Value::Bytes(s.address.clone()),
                        Value::Int(s.port),
                        Value::Int(s.generation),
                        Value::Timestamp(s.at_ns),
                    ])
                })
            })
            .collect(),
    );

    let outcome = Outcome::none()
        .with_set(version_set)
        .with_set(member_set)
        .with_set(suspect_set);
    Ok((outcome, Vec::new()))
}

fn read_member_row<S: RowStore + ?Sized>(store: &S, params: &Params) -> Executed {
    let cluster_id = params.require_text(param::CLUSTER_ID)?;
    let key = member_key(params)?;
    let empty = || Outcome::none().with_set(ResultSet::default()).with_set(ResultSet::default());

    let Some(version) = store.version_row(cluster_id)? else {
        return Ok((empty(), Vec::new()));
    };
    let Some(m) = store.member_row(cluster_id, &key)? else {
        return Ok((empty(), Vec::new()));
    };

    let member_set = ResultSet::new(vec![Row::new(vec![
        Value::Text(m.name.clone()),
        Value::Text(m.host.clone()),
        Value::SmallInt(m.status),
        Value::Int(m.proxy_port),
        Value::Timestamp(m.start_time_ns),
        Value::Timestamp(m.heartbeat_ns),
        Value::BigInt(m.etag_no),
        Value::BigInt(m.version),
        Value::BigInt(version.etag_no),
        Value::BigInt(version.version),
    ])]);
    let suspect_set = ResultSet::new(
        m.suspects
            .iter()
            .map(|s| {
                Row::new(vec![
                    Value::Bytes(s.address.clone()),
                    Value::Int(s.port),
                    Value::Int(s.generation),
                    Value::Timestamp(s.at_ns),
                ])
            })
            .collect(),
    );
    Ok((Outcome::none().with_set(member_set).with_set(suspect_set), Vec::new()))
}

fn update_heartbeat<S: RowStore + ?Sized>(store: &S, params: &Params) -> Executed {
    let heartbeat_ns = params.require_timestamp(param::HEARTBEAT_TIME)?;
    let cluster_id = params.require_text(param::CLUSTER_ID)?;
    let key = member_key(params)?;
    // Heartbeats touch neither the version row nor the row etag.
    match store.member_row(cluster_id, &key)? {
        Some(mut row) => {
            row.heartbeat_ns = heartbeat_ns;
            Ok((Outcome::none(), vec![Mutation::PutMember(row)]))
        }
        None => Ok((Outcome::none(), Vec::new())),
    }
}

fn delete_cluster<S: RowStore + ?Sized>(store: &S, params: &Params) -> Executed {
    let cluster_id = params.require_text(param::CLUSTER_ID)?;
    let mut mutations: Vec<Mutation> = store
        .member_rows(cluster_id)?
        .into_iter()
        .map(|m| Mutation::DeleteMember { cluster_id: m.cluster_id, key: m.key })
        .collect();
    mutations.push(Mutation::DeleteVersion { cluster_id: cluster_id.to_string() });
    Ok((Outcome::none(), mutations))
}

fn delete_defunct<S: RowStore + ?Sized>(store: &S, params: &Params) -> Executed {
    let cluster_id = params.require_text(param::CLUSTER_ID)?;
    let before_ns = params.require_timestamp(param::BEFORE_TIME)?;
    let active = NodeStatus::Active.code();
    let mutations = store
        .member_rows(cluster_id)?
        .into_iter()
        .filter(|m| m.status != active && m.heartbeat_ns < before_ns)
        .map(|m| Mutation::DeleteMember { cluster_id: m.cluster_id, key: m.key })
        .collect();
    Ok((Outcome::none(), mutations))
}

fn read_gateways<S: RowStore + ?Sized>(store: &S, params: &Params) -> Executed {
    let cluster_id = params.require_text(param::CLUSTER_ID)?;
    let status = params.require_i16(param::STATUS)?;
    let mut members = store.member_rows(cluster_id)?;
    members.sort_by_key(|m| m.member_id);
    let rows = members
        .into_iter()
        .filter(|m| m.status == status && m.proxy_port > 0)
        .map(|m| {
            Row::new(vec![
                Value::Bytes(m.key.address),
                Value::Int(m.proxy_port),
                Value::Int(m.key.generation),
            ])
        })
        .collect();
    Ok((Outcome::none().with_set(ResultSet::new(rows)), Vec::new()))
}

// ---------------------------------------------------------------------------
// Reminders
// ---------------------------------------------------------------------------

fn reminder_key(params: &Params) -> Result<ReminderKey, SkuldError> {
    Ok(ReminderKey {
        grain_type: params.require_text(param::GRAIN_TYPE)?.to_string(),
        grain_key: params.require_bytes(param::GRAIN_KEY)?.to_vec(),
        name: params.require_text(param::REMINDER_NAME)?.to_string(),
    })
}

fn reminder_columns(row: &ReminderRow) -> Row {
    Row::new(vec![
        Value::Bytes(row.key.grain_key.clone()),
        Value::Text(row.key.grain_type.clone()),
        Value::Text(row.key.name.clone()),
        Value::Timestamp(row.start_at_ns),
        Value::BigInt(row.period_ns),
        Value::BigInt(row.version),
    ])
}

fn hash_param(params: &Params, name: &str) -> Result<u32, SkuldError> {
    let raw = params.require_i64(name)?;
    u32::try_from(raw).map_err(|_| SkuldError::Backend(format!("{name} {raw} is not a 32-bit hash")))
}

fn read_reminder_row<S: RowStore + ?Sized>(store: &S, params: &Params) -> Executed {
    let key = reminder_key(params)?;
    let rows = store.reminder_row(&key)?.iter().map(reminder_columns).collect();
    Ok((Outcome::none().with_set(ResultSet::new(rows)), Vec::new()))
}

fn read_reminder_rows<S: RowStore + ?Sized>(store: &S, params: &Params) -> Executed {
    let grain_type = params.require_text(param::GRAIN_TYPE)?;
    let grain_key = params.require_bytes(param::GRAIN_KEY)?;
    let mut rows = store.reminder_rows_for_grain(grain_type, grain_key)?;
    rows.sort_by(|a, b| a.key.cmp(&b.key));
    let rows = rows.iter().map(reminder_columns).collect();
    Ok((Outcome::none().with_set(ResultSet::new(rows)), Vec::new()))
}

fn read_reminder_range<S: RowStore + ?Sized>(store: &S, params: &Params, wrapped: bool) -> Executed {
    let begin = hash_param(params, param::BEGIN_HASH)?;
    let end = hash_param(params, param::END_HASH)?;
    let mut rows = match (wrapped, begin <= end) {
        (false, true) => store.reminder_rows_in_hash_range(begin, end)?,
        (true, false) => {
            let mut upper = store.reminder_rows_in_hash_range(begin, u32::MAX)?;
            upper.extend(store.reminder_rows_in_hash_range(0, end)?);
            upper
        }
        _ => {
            return Err(SkuldError::Backend(format!(
                "hash range [{begin}, {end}] does not fit {}",
                if wrapped { "a wrapped scan" } else { "a linear scan" }
            )))
        }
    };
    rows.sort_by(|a, b| (a.grain_hash, &a.key).cmp(&(b.grain_hash, &b.key)));
    let rows = rows.iter().map(reminder_columns).collect();
    Ok((Outcome::none().with_set(ResultSet::new(rows)), Vec::new()))
}

fn upsert_reminder<S: RowStore + ?Sized>(store: &S, params: &Params) -> Executed {
    let key = reminder_key(params)?;
    let old_version = params.require_i64(param::OLD_VERSION)?;
    let stored = store.reminder_row(&key)?.map(|r| r.version).unwrap_or(0);
    if stored != old_version {
        return Err(SkuldError::Conflict(format!(
            "reminder '{}' is at version {stored}, caller expected {old_version}",
            key.name
        )));
    }
    let new_version = old_version + 1;
    let row = ReminderRow {
        key,
        start_at_ns: params.require_timestamp(param::START_TIME)?,
        period_ns: params.require_i64(param::PERIOD)?,
        grain_hash: hash_param(params, param::GRAIN_HASH)?,
        version: new_version,
    };
    let outcome = Outcome::none().with_output(output::NEW_VERSION, Value::BigInt(new_version));
    Ok((outcome, vec![Mutation::PutReminder(row)]))
}

fn delete_reminder<S: RowStore + ?Sized>(store: &S, params: &Params) -> Executed {
    let key = reminder_key(params)?;
    let version = params.require_i64(param::VERSION)?;
    match store.reminder_row(&key)? {
        Some(row) if row.version == version => {
            let grain_hash = row.grain_hash;
            Ok((
                Outcome::none().with_output(output::IS_FOUND, Value::Bool(true)),
                vec![Mutation::DeleteReminder { key, grain_hash }],
            ))
        }
        _ => Ok((Outcome::none().with_output(output::IS_FOUND, Value::Bool(false)), Vec::new())),
    }
}
