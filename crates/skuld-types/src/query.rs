//! Parameter and result contract between the directories and the storage
//! backend. Each directory operation maps to exactly one [`Procedure`] call
//! with an ordered, typed parameter list.

use crate::SkuldError;

/// Named backend procedures. Names carry a layout version; only `V1` exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Procedure {
    MembershipInsertVersion,
    MembershipInsert,
    MembershipUpdate,
    MembershipReadAll,
    MembershipReadRow,
    MembershipUpdateHeartbeat,
    MembershipDeleteCluster,
    MembershipDeleteDefunct,
    MembershipGateways,
    ReminderReadRow,
    ReminderReadRows,
    ReminderReadRange,
    ReminderReadRangeWrapped,
    ReminderUpsert,
    ReminderDelete,
}

impl Procedure {
    pub const ALL: [Procedure; 15] = [
        Procedure::MembershipInsertVersion,
        Procedure::MembershipInsert,
        Procedure::MembershipUpdate,
        Procedure::MembershipReadAll,
        Procedure::MembershipReadRow,
        Procedure::MembershipUpdateHeartbeat,
        Procedure::MembershipDeleteCluster,
        Procedure::MembershipDeleteDefunct,
        Procedure::MembershipGateways,
        Procedure::ReminderReadRow,
        Procedure::ReminderReadRows,
        Procedure::ReminderReadRange,
        Procedure::ReminderReadRangeWrapped,
        Procedure::ReminderUpsert,
        Procedure::ReminderDelete,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Procedure::MembershipInsertVersion => "wtr.MembershipInsertVersionV1",
            Procedure::MembershipInsert => "wtr.MembershipInsertMemberV1",
            Procedure::MembershipUpdate => "wtr.MembershipUpdateMemberV1",
            Procedure::MembershipReadAll => "rdr.MembershipReadAllV1",
            Procedure::MembershipReadRow => "rdr.MembershipReadRowV1",
            Procedure::MembershipUpdateHeartbeat => "wtr.MembershipUpdateHeartbeatV1",
            Procedure::MembershipDeleteCluster => "wtr.MembershipDeleteClusterV1",
            Procedure::MembershipDeleteDefunct => "wtr.MembershipDeleteDefunctV1",
            Procedure::MembershipGateways => "rdr.MembershipGatewaysV1",
            Procedure::ReminderReadRow => "rdr.ReminderReadRowV1",
            Procedure::ReminderReadRows => "rdr.ReminderReadRowsV1",
            Procedure::ReminderReadRange => "rdr.ReminderReadRangeRows1V1",
            Procedure::ReminderReadRangeWrapped => "rdr.ReminderReadRangeRows2V1",
            Procedure::ReminderUpsert => "wtr.ReminderUpsertRowV1",
            Procedure::ReminderDelete => "wtr.ReminderDeleteRowV1",
        }
    }

    /// Read procedures never mutate and may run under a shared lock.
    pub fn is_read(self) -> bool {
        self.name().starts_with("rdr.")
    }
}

impl std::fmt::Display for Procedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Parameter names shared by both sides of the contract.
pub mod param {
    pub const CLUSTER_ID: &str = "@ClusterId";
    pub const ADDRESS: &str = "@Address";
    pub const PORT: &str = "@Port";
    pub const GENERATION: &str = "@Generation";
    pub const NAME: &str = "@Name";
    pub const HOST: &str = "@Host";
    pub const STATUS: &str = "@Status";
    pub const PROXY_PORT: &str = "@ProxyPort";
    pub const START_TIME: &str = "@StartTime";
    pub const HEARTBEAT_TIME: &str = "@HeartbeatTime";
    pub const ETAG_NO: &str = "@ETagNo";
    pub const VERSION: &str = "@Version";
    pub const ROW_ETAG_NO: &str = "@RowETagNo";
    pub const SUSPECT_TIMES: &str = "@SuspectTimes";
    pub const BEFORE_TIME: &str = "@BeforeTime";
    pub const GRAIN_KEY: &str = "@GrainKey";
    pub const GRAIN_TYPE: &str = "@GrainType";
    pub const REMINDER_NAME: &str = "@ReminderName";
    pub const PERIOD: &str = "@Period";
    pub const GRAIN_HASH: &str = "@GrainHash";
    pub const OLD_VERSION: &str = "@OldVersion";
    pub const BEGIN_HASH: &str = "@BeginHash";
    pub const END_HASH: &str = "@EndHash";
}

/// Output parameter names.
pub mod output {
    pub const UPDATED: &str = "@Updated";
    pub const NEW_VERSION: &str = "@NewVersion";
    pub const IS_FOUND: &str = "@IsFound";
}

/// Logical column/parameter value. Timestamps are Unix nanoseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Bool(bool),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(i64),
    Table(Vec<Row>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::SmallInt(_) => "smallint",
            Value::Int(_) => "int",
            Value::BigInt(_) => "bigint",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Timestamp(_) => "timestamp",
            Value::Table(_) => "table",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<i16> {
        match self {
            Value::SmallInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::SmallInt(v) => Some(i32::from(*v)),
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::SmallInt(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            Value::Timestamp(ns) => Some(*ns),
            _ => None,
        }
    }
}

fn column_err(what: &str, expected: &str, got: &Value) -> SkuldError {
    SkuldError::Backend(format!("{what}: expected {expected}, got {}", got.kind()))
}

/// One row of a result set, or of a table-valued parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row(pub Vec<Value>);

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Row(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn column(&self, idx: usize) -> Result<&Value, SkuldError> {
        self.0.get(idx).ok_or_else(|| {
            SkuldError::Backend(format!("column {idx} missing from {}-column row", self.0.len()))
        })
    }

    pub fn is_null(&self, idx: usize) -> bool {
        matches!(self.0.get(idx), None | Some(Value::Null))
    }

    pub fn get_bool(&self, idx: usize) -> Result<bool, SkuldError> {
        let v = self.column(idx)?;
        v.as_bool().ok_or_else(|| column_err(&format!("column {idx}"), "bool", v))
    }

    pub fn get_i16(&self, idx: usize) -> Result<i16, SkuldError> {
        let v = self.column(idx)?;
        v.as_i16().ok_or_else(|| column_err(&format!("column {idx}"), "smallint", v))
    }

    pub fn get_i32(&self, idx: usize) -> Result<i32, SkuldError> {
        let v = self.column(idx)?;
        v.as_i32().ok_or_else(|| column_err(&format!("column {idx}"), "int", v))
    }

    pub fn get_i64(&self, idx: usize) -> Result<i64, SkuldError> {
        let v = self.column(idx)?;
        v.as_i64().ok_or_else(|| column_err(&format!("column {idx}"), "bigint", v))
    }

    pub fn get_text(&self, idx: usize) -> Result<&str, SkuldError> {
        let v = self.column(idx)?;
        v.as_text().ok_or_else(|| column_err(&format!("column {idx}"), "text", v))
    }

    pub fn get_bytes(&self, idx: usize) -> Result<&[u8], SkuldError> {
        let v = self.column(idx)?;
        v.as_bytes().ok_or_else(|| column_err(&format!("column {idx}"), "bytes", v))
    }

    pub fn get_timestamp(&self, idx: usize) -> Result<i64, SkuldError> {
        let v = self.column(idx)?;
        v.as_timestamp().ok_or_else(|| column_err(&format!("column {idx}"), "timestamp", v))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub rows: Vec<Row>,
}

impl ResultSet {
    pub fn new(rows: Vec<Row>) -> Self {
        ResultSet { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }
}

/// Ordered, named parameter list for one procedure call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(&'static str, Value)>);

impl Params {
    pub fn new() -> Self {
        Params(Vec::new())
    }

    pub fn with(mut self, name: &'static str, value: Value) -> Self {
        self.0.push((name, value));
        self
    }

    pub fn text(self, name: &'static str, value: impl Into<String>) -> Self {
        self.with(name, Value::Text(value.into()))
    }

    pub fn bytes(self, name: &'static str, value: impl Into<Vec<u8>>) -> Self {
        self.with(name, Value::Bytes(value.into()))
    }

    pub fn small_int(self, name: &'static str, value: i16) -> Self {
        self.with(name, Value::SmallInt(value))
    }

    pub fn int(self, name: &'static str, value: i32) -> Self {
        self.with(name, Value::Int(value))
    }

    pub fn big_int(self, name: &'static str, value: i64) -> Self {
        self.with(name, Value::BigInt(value))
    }

    pub fn timestamp(self, name: &'static str, ns: i64) -> Self {
        self.with(name, Value::Timestamp(ns))
    }

    /// Table-valued parameter. An empty table is sent as `Null`.
    pub fn table(self, name: &'static str, rows: Vec<Row>) -> Self {
        if rows.is_empty() {
            self.with(name, Value::Null)
        } else {
            self.with(name, Value::Table(rows))
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.iter().map(|(n, _)| *n)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    fn require(&self, name: &str) -> Result<&Value, SkuldError> {
        self.get(name)
            .ok_or_else(|| SkuldError::Backend(format!("parameter {name} missing")))
    }

    pub fn require_text(&self, name: &str) -> Result<&str, SkuldError> {
        let v = self.require(name)?;
        v.as_text().ok_or_else(|| column_err(name, "text", v))
    }

    pub fn require_bytes(&self, name: &str) -> Result<&[u8], SkuldError> {
        let v = self.require(name)?;
        v.as_bytes().ok_or_else(|| column_err(name, "bytes", v))
    }

    pub fn require_i16(&self, name: &str) -> Result<i16, SkuldError> {
        let v = self.require(name)?;
        v.as_i16().ok_or_else(|| column_err(name, "smallint", v))
    }

    pub fn require_i32(&self, name: &str) -> Result<i32, SkuldError> {
        let v = self.require(name)?;
        v.as_i32().ok_or_else(|| column_err(name, "int", v))
    }

    pub fn require_i64(&self, name: &str) -> Result<i64, SkuldError> {
        let v = self.require(name)?;
        v.as_i64().ok_or_else(|| column_err(name, "bigint", v))
    }

    pub fn require_timestamp(&self, name: &str) -> Result<i64, SkuldError> {
        let v = self.require(name)?;
        v.as_timestamp().ok_or_else(|| column_err(name, "timestamp", v))
    }

    /// Rows of a table-valued parameter; `Null` reads as no rows.
    pub fn require_table(&self, name: &str) -> Result<&[Row], SkuldError> {
        match self.require(name)? {
            Value::Null => Ok(&[]),
            Value::Table(rows) => Ok(rows),
            other => Err(column_err(name, "table", other)),
        }
    }
}

/// Everything a single procedure call produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    pub result_sets: Vec<ResultSet>,
    pub outputs: Vec<(&'static str, Value)>,
}

impl Outcome {
    pub fn none() -> Self {
        Outcome::default()
    }

    pub fn with_set(mut self, set: ResultSet) -> Self {
        self.result_sets.push(set);
        self
    }

    pub fn with_output(mut self, name: &'static str, value: Value) -> Self {
        self.outputs.push((name, value));
        self
    }

    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn take_output(&mut self, name: &str) -> Option<Value> {
        let idx = self.outputs.iter().position(|(n, _)| *n == name)?;
        Some(self.outputs.swap_remove(idx).1)
    }
}
