//! Built-in template catalog seeded into the root bucket on first boot.
//!
//! Every new node copies the `_template_*` entries of its parent, so these
//! lists end up on every leaf of a fresh tree.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::constants::ID_PROPERTY;
use crate::constants::RES_ALARM;
use crate::constants::RES_COLLECT;
use crate::constants::TEMPLATE_PREFIX;
use crate::resource::Resource;
use crate::resource::ResourceError;
use crate::resource::codec;

/// `(name, measurement_type, interval seconds, comment)` of each default collector.
const COLLECT_TEMPLATES: &[(&str, &str, &str, &str)] = &[
    ("cpu", "CPU", "10", "cpu usage"),
    ("mem", "MEM", "10", "memory usage"),
    ("disk", "DISK", "60", "disk usage per mount"),
    ("fs", "FS", "60", "filesystem inodes and readonly state"),
    ("net", "NET", "10", "interface traffic"),
    ("load", "LOAD", "10", "system load"),
    ("tcp", "TCP", "30", "tcp connection states"),
    ("io", "IO", "10", "block device io"),
];

/// `(name, measurement, function, expression, value)` of each default alarm.
const ALARM_TEMPLATES: &[(&str, &str, &str, &str, &str)] = &[
    ("cpu idle low", "cpu.idle", "mean", "<", "10"),
    ("memory used high", "mem.used_percent", "mean", ">", "90"),
    ("disk used high", "disk.used_percent", "max", ">", "90"),
    ("load high", "load.load5", "mean", ">", "32"),
];

fn resource(pairs: &[(&str, &str)]) -> Resource {
    let mut r: Resource = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    r.insert(ID_PROPERTY.to_string(), Uuid::new_v4().to_string());
    r
}

pub fn collect_templates() -> Vec<Resource> {
    COLLECT_TEMPLATES
        .iter()
        .map(|(name, mtype, interval, comment)| {
            resource(&[
                ("name", name),
                ("measurement_type", mtype),
                ("interval", interval),
                ("comment", comment),
            ])
        })
        .collect()
}

pub fn alarm_templates() -> Vec<Resource> {
    ALARM_TEMPLATES
        .iter()
        .map(|(name, measurement, function, expression, value)| {
            resource(&[
                ("name", name),
                ("measurement", measurement),
                ("function", function),
                ("expression", expression),
                ("value", value),
                ("period", "5m"),
                ("every", "1m"),
                ("level", "1"),
                ("alert", "mail"),
                ("enable", "true"),
                ("groups", ""),
                ("db", ""),
                ("version", ""),
            ])
        })
        .collect()
}

/// Encoded catalog, keyed by template resource type.
pub fn catalog() -> Result<BTreeMap<String, Vec<u8>>, ResourceError> {
    let mut out = BTreeMap::new();
    out.insert(format!("{TEMPLATE_PREFIX}{RES_COLLECT}"), codec::marshal(&collect_templates())?);
    out.insert(format!("{TEMPLATE_PREFIX}{RES_ALARM}"), codec::marshal(&alarm_templates())?);
    Ok(out)
}
