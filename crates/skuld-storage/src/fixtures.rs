//! Parameter builders shared by the backend tests.

use skuld_types::query::param;
use skuld_types::{NodeStatus, Params, Row, Value};

pub const CLUSTER: &str = "c1";
pub const ADDR: [u8; 4] = [10, 0, 0, 1];

pub fn version(cluster: &str) -> Params {
    Params::new()
        .text(param::CLUSTER_ID, cluster)
        .big_int(param::ETAG_NO, 0)
        .big_int(param::VERSION, 0)
}

pub fn insert(cluster: &str, port: i32, status: NodeStatus, etag_no: i64, version: i64) -> Params {
    Params::new()
        .text(param::CLUSTER_ID, cluster)
        .bytes(param::ADDRESS, ADDR.to_vec())
        .int(param::PORT, port)
        .int(param::GENERATION, 1)
        .text(param::NAME, format!("silo-{port}"))
        .text(param::HOST, "host-a")
        .small_int(param::STATUS, status.code())
        .int(param::PROXY_PORT, 30000)
        .timestamp(param::START_TIME, 1_000)
        .timestamp(param::HEARTBEAT_TIME, 2_000)
        .big_int(param::ETAG_NO, etag_no)
        .big_int(param::VERSION, version)
        .table(
            param::SUSPECT_TIMES,
            vec![Row::new(vec![
                Value::Bytes(ADDR.to_vec()),
                Value::Int(9),
                Value::Int(1),
                Value::Timestamp(1_500),
            ])],
        )
}

pub fn update(
    cluster: &str,
    port: i32,
    status: NodeStatus,
    etag_no: i64,
    version: i64,
    row_etag_no: i64,
) -> Params {
    Params::new()
        .text(param::CLUSTER_ID, cluster)
        .small_int(param::STATUS, status.code())
        .int(param::PROXY_PORT, 30000)
        .timestamp(param::HEARTBEAT_TIME, 3_000)
        .bytes(param::ADDRESS, ADDR.to_vec())
        .int(param::PORT, port)
        .int(param::GENERATION, 1)
        .table(param::SUSPECT_TIMES, Vec::new())
        .big_int(param::ETAG_NO, etag_no)
        .big_int(param::VERSION, version)
        .big_int(param::ROW_ETAG_NO, row_etag_no)
        .text(param::NAME, format!("silo-{port}"))
        .text(param::HOST, "host-a")
        .timestamp(param::START_TIME, 1_000)
}

pub fn member(cluster: &str, port: i32) -> Params {
    Params::new()
        .text(param::CLUSTER_ID, cluster)
        .bytes(param::ADDRESS, ADDR.to_vec())
        .int(param::PORT, port)
        .int(param::GENERATION, 1)
}

pub fn heartbeat(cluster: &str, port: i32, at_ns: i64) -> Params {
    Params::new()
        .timestamp(param::HEARTBEAT_TIME, at_ns)
        .text(param::CLUSTER_ID, cluster)
        .bytes(param::ADDRESS, ADDR.to_vec())
        .int(param::PORT, port)
        .int(param::GENERATION, 1)
}

pub fn cluster(cluster: &str) -> Params {
    Params::new().text(param::CLUSTER_ID, cluster)
}

pub fn reminder(grain: &str, name: &str) -> Params {
    Params::new()
        .bytes(param::GRAIN_KEY, grain.as_bytes().to_vec())
        .text(param::GRAIN_TYPE, "counter")
        .text(param::REMINDER_NAME, name)
}

pub fn upsert(grain: &str, name: &str, hash: u32, old_version: i64) -> Params {
    reminder(grain, name)
        .timestamp(param::START_TIME, 5_000)
        .big_int(param::PERIOD, 60_000_000_000)
        .big_int(param::GRAIN_HASH, i64::from(hash))
        .big_int(param::OLD_VERSION, old_version)
}

pub fn delete(grain: &str, name: &str, version: i64) -> Params {
    reminder(grain, name).big_int(param::VERSION, version)
}

pub fn range(begin: u32, end: u32) -> Params {
    Params::new()
        .big_int(param::BEGIN_HASH, i64::from(begin))
        .big_int(param::END_HASH, i64::from(end))
}
