//! Alarm resources inherited by a new node.
//!
//! A copied alarm template must point at the new node: its notification
//! group becomes the node's ops group, its database is the node's collect
//! database, and its version is recomputed from the rewritten content.

use crate::constants::ID_PROPERTY;
use crate::resource::Resource;
use crate::resource::ResourceError;
use crate::resource::codec;
use crate::tree::ns_op_group;

pub const GROUPS_PROPERTY: &str = "groups";
pub const DB_PROPERTY: &str = "db";
pub const VERSION_PROPERTY: &str = "version";
pub const MEASUREMENT_PROPERTY: &str = "measurement";

/// Database name the collectors of `ns` write into.
pub fn collect_db(ns: &str) -> String {
    format!("collect.{ns}")
}

/// Rewrites one alarm for `ns`.
///
/// The version is `ns__measurement__id__md5`, where the digest covers the
/// JSON of the alarm with its version field cleared.
pub fn rewrite_alarm(alarm: &mut Resource, ns: &str) {
    alarm.insert(GROUPS_PROPERTY.to_string(), ns_op_group(ns));
    alarm.insert(DB_PROPERTY.to_string(), collect_db(ns));
    alarm.remove(VERSION_PROPERTY);
    // BTreeMap keeps the JSON stable across members.
    let json = serde_json::to_string(&*alarm).unwrap_or_default();
    let digest = md5::compute(json.as_bytes());
    let measurement = alarm.get(MEASUREMENT_PROPERTY).map(String::as_str).unwrap_or_default();
    let id = alarm.get(ID_PROPERTY).map(String::as_str).unwrap_or_default();
    let version = format!("{ns}__{measurement}__{id}__{digest:x}");
    alarm.insert(VERSION_PROPERTY.to_string(), version);
}

/// Rewrites every alarm of an encoded list.
pub fn rewrite_alarms(data: &[u8], ns: &str) -> Result<Vec<u8>, ResourceError> {
    let mut alarms = codec::unmarshal(data)?;
    for alarm in &mut alarms {
        rewrite_alarm(alarm, ns);
    }
    codec::marshal_or_empty(&alarms)
}
