//! Byte encoding of resource lists.
//!
//! ```text
//! property := key 0x01 value'        value' = value, or 0x03 when value is ""
//! resource := id 0x00 [ property (0x01 0x01 property)* ]
//! stream   := resource (0x01 0x01 0x01 resource)* 0x02
//! ```
//!
//! An empty list is stored as a zero-length value. Runs of `0x01` are the
//! only structure inside a resource: one ends a key, two end a property,
//! three end a resource. Nothing in an id, key, or value may be a control
//! byte `0x00..=0x03`, so a stream can be walked once, left to right, without
//! decoding resources the caller does not need.

use std::collections::BTreeMap;
use std::collections::HashSet;

use thiserror::Error;
use uuid::Uuid;

use crate::constants::ID_PROPERTY;
use crate::error::RegistryError;

pub const ID_END: u8 = 0x00;
pub const SEP: u8 = 0x01;
pub const END: u8 = 0x02;
pub const EMPTY_VALUE: u8 = 0x03;

const RESOURCE_SEP: [u8; 3] = [SEP, SEP, SEP];
const PROPERTY_SEP: [u8; 2] = [SEP, SEP];

/// One resource: property name to value, `_id` included.
pub type Resource = BTreeMap<String, String>;
pub type ResourceList = Vec<Resource>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("empty resource list")]
    Empty,

    #[error("invalid resource format: {0}")]
    InvalidFormat(String),

    #[error("resource has no _id")]
    MissingId,

    #[error("resource {0} not found")]
    IdNotFound(String),

    #[error("invalid resource query: {0}")]
    InvalidQuery(String),
}

impl From<ResourceError> for RegistryError {
    fn from(err: ResourceError) -> Self {
        match err {
            ResourceError::Empty | ResourceError::MissingId | ResourceError::InvalidQuery(_) => {
                RegistryError::invalid_param(err.to_string())
            }
            ResourceError::InvalidFormat(_) => RegistryError::invalid_format(err.to_string()),
            ResourceError::IdNotFound(_) => RegistryError::not_found(err.to_string()),
        }
    }
}

fn invalid(reason: impl Into<String>) -> ResourceError {
    ResourceError::InvalidFormat(reason.into())
}

fn is_control(b: u8) -> bool {
    b <= EMPTY_VALUE
}

fn check_token(what: &str, token: &str, allow_empty: bool) -> Result<(), ResourceError> {
    if !allow_empty && token.is_empty() {
        return Err(invalid(format!("empty {what}")));
    }
    if token.bytes().any(is_control) {
        return Err(invalid(format!("{what} {token:?} contains a control byte")));
    }
    Ok(())
}

/// Appends the encoding of one resource, without any trailing separator.
fn encode_resource(out: &mut Vec<u8>, resource: &Resource) -> Result<(), ResourceError> {
    let id = resource.get(ID_PROPERTY).ok_or(ResourceError::MissingId)?;
    check_token("id", id, false)?;
    out.extend_from_slice(id.as_bytes());
    out.push(ID_END);

    let mut first = true;
    for (key, value) in resource.iter().filter(|(k, _)| k.as_str() != ID_PROPERTY) {
        check_token("key", key, false)?;
        check_token("value", value, true)?;
        if !first {
            out.extend_from_slice(&PROPERTY_SEP);
        }
        first = false;
        out.extend_from_slice(key.as_bytes());
        out.push(SEP);
        if value.is_empty() {
            out.push(EMPTY_VALUE);
        } else {
            out.extend_from_slice(value.as_bytes());
        }
    }
    Ok(())
}

/// Encodes a non-empty list.
pub fn marshal(list: &[Resource]) -> Result<Vec<u8>, ResourceError> {
    if list.is_empty() {
        return Err(ResourceError::Empty);
    }
    let mut out = Vec::new();
    for resource in list {
        encode_resource(&mut out, resource)?;
        out.extend_from_slice(&RESOURCE_SEP);
    }
    out.truncate(out.len() - RESOURCE_SEP.len());
    out.push(END);
    Ok(out)
}

/// Encodes a list, mapping the empty list to a zero-length value.
pub fn marshal_or_empty(list: &[Resource]) -> Result<Vec<u8>, ResourceError> {
    if list.is_empty() {
        Ok(Vec::new())
    } else {
        marshal(list)
    }
}

/// Joins already-encoded resource slices into a stream.
fn join_spans<'a>(spans: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    for span in spans {
        if !out.is_empty() {
            out.extend_from_slice(&RESOURCE_SEP);
        }
        out.extend_from_slice(span);
    }
    if !out.is_empty() {
        out.push(END);
    }
    out
}

/// A resource inside a stream, borrowed from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawResource<'a> {
    raw: &'a [u8],
    id: &'a [u8],
    body: &'a [u8],
}

impl<'a> RawResource<'a> {
    /// The encoded resource, without separators.
    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    pub fn id(&self) -> &'a [u8] {
        self.id
    }

    /// `(key, value)` pairs excluding `_id`, with the empty sentinel decoded.
    pub fn properties(&self) -> Properties<'a> {
        Properties { rest: self.body }
    }

    /// Value of `key`, `_id` included.
    pub fn get(&self, key: &[u8]) -> Result<Option<&'a [u8]>, ResourceError> {
        if key == ID_PROPERTY.as_bytes() {
            return Ok(Some(self.id));
        }
        for prop in self.properties() {
            let (k, v) = prop?;
            if k == key {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    pub fn decode(&self) -> Result<Resource, ResourceError> {
        let mut resource = Resource::new();
        resource.insert(ID_PROPERTY.to_string(), utf8(self.id)?);
        for prop in self.properties() {
            let (k, v) = prop?;
            resource.insert(utf8(k)?, utf8(v)?);
        }
        Ok(resource)
    }
}

fn utf8(bytes: &[u8]) -> Result<String, ResourceError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| invalid("token is not valid UTF-8"))
}

/// Iterator over the properties of a [`RawResource`].
pub struct Properties<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Properties<'a> {
    type Item = Result<(&'a [u8], &'a [u8]), ResourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        let data = self.rest;
        if data.is_empty() {
            return None;
        }
        let (prop, rest) = match find_run(data, 2) {
            Some(at) => (&data[..at], &data[at + 2..]),
            None => (data, &data[data.len()..]),
        };
        if rest.is_empty() && prop.len() < data.len() {
            // Separator with nothing after it.
            self.rest = rest;
            return Some(Err(invalid("dangling property separator")));
        }
        self.rest = rest;
        Some(split_property(prop))
    }
}

/// Position of the first run of exactly `len` separators.
fn find_run(data: &[u8], len: usize) -> Option<usize> {
    let mut i = 0;
    while i < data.len() {
        if data[i] == SEP {
            let start = i;
            while i < data.len() && data[i] == SEP {
                i += 1;
            }
            if i - start == len {
                return Some(start);
            }
        } else {
            i += 1;
        }
    }
    None
}

fn split_property(prop: &[u8]) -> Result<(&[u8], &[u8]), ResourceError> {
    let at = prop
        .iter()
        .position(|&b| b == SEP)
        .ok_or_else(|| invalid("property without key separator"))?;
    let (key, value) = (&prop[..at], &prop[at + 1..]);
    if key.is_empty() {
        return Err(invalid("empty property key"));
    }
    if key.iter().any(|&b| is_control(b)) {
        return Err(invalid("control byte in property key"));
    }
    match value {
        [EMPTY_VALUE] => Ok((key, &[])),
        [] => Err(invalid("missing property value")),
        v if v.iter().any(|&b| is_control(b)) => Err(invalid("control byte in property value")),
        v => Ok((key, v)),
    }
}

fn parse_resource(raw: &[u8]) -> Result<RawResource<'_>, ResourceError> {
    let at = raw
        .iter()
        .position(|&b| b == ID_END)
        .ok_or_else(|| invalid("resource without id terminator"))?;
    let (id, body) = (&raw[..at], &raw[at + 1..]);
    if id.is_empty() {
        return Err(ResourceError::MissingId);
    }
    if id.iter().any(|&b| is_control(b)) || body.contains(&ID_END) {
        return Err(invalid("misplaced id terminator"));
    }
    Ok(RawResource { raw, id, body })
}

/// Walks a stream resource by resource.
pub struct Resources<'a> {
    rest: &'a [u8],
    done: bool,
}

/// Starts a walk over `data`. The end-of-stream byte is checked up front so
/// a truncated value never yields a partial list.
pub fn walk(data: &[u8]) -> Result<Resources<'_>, ResourceError> {
    if data.is_empty() {
        return Ok(Resources { rest: data, done: true });
    }
    let Some((&END, body)) = data.split_last() else {
        return Err(invalid("missing end-of-stream byte"));
    };
    if body.contains(&END) {
        return Err(invalid("end-of-stream byte inside stream"));
    }
    if body.is_empty() {
        return Err(invalid("empty resource"));
    }
    Ok(Resources { rest: body, done: false })
}

impl<'a> Iterator for Resources<'a> {
    type Item = Result<RawResource<'a>, ResourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        // Automaton over separator runs: 1 and 2 stay inside the resource,
        // 3 ends it, anything longer is corrupt.
        let data = self.rest;
        let mut i = 0;
        while i < data.len() {
            if data[i] != SEP {
                i += 1;
                continue;
            }
            let start = i;
            while i < data.len() && data[i] == SEP {
                i += 1;
            }
            match i - start {
                1 | 2 => {}
                3 => {
                    self.rest = &data[i..];
                    if self.rest.is_empty() {
                        self.done = true;
                        return Some(Err(invalid("resource separator before end of stream")));
                    }
                    return Some(parse_resource(&data[..start]));
                }
                n => {
                    self.done = true;
                    return Some(Err(invalid(format!("run of {n} separators"))));
                }
            }
        }
        self.done = true;
        Some(parse_resource(data))
    }
}

/// Decodes a stream; a zero-length value is the empty list.
pub fn unmarshal(data: &[u8]) -> Result<ResourceList, ResourceError> {
    walk(data)?.map(|raw| raw?.decode()).collect()
}

/// Number of resources in a stream.
pub fn count(data: &[u8]) -> Result<usize, ResourceError> {
    let mut n = 0;
    for raw in walk(data)? {
        raw?;
        n += 1;
    }
    Ok(n)
}

/// Decodes the resource with `id`, if present.
pub fn get_by_id(data: &[u8], id: &str) -> Result<Option<Resource>, ResourceError> {
    for raw in walk(data)? {
        let raw = raw?;
        if raw.id() == id.as_bytes() {
            return raw.decode().map(Some);
        }
    }
    Ok(None)
}

/// Merges `patch` into the resource with `id`. `_id` in the patch is ignored.
pub fn update_by_id(data: &[u8], id: &str, patch: &Resource) -> Result<Vec<u8>, ResourceError> {
    let mut found = false;
    let mut out = Vec::with_capacity(data.len());
    for raw in walk(data)? {
        let raw = raw?;
        if !out.is_empty() {
            out.extend_from_slice(&RESOURCE_SEP);
        }
        if raw.id() == id.as_bytes() {
            found = true;
            let mut resource = raw.decode()?;
            for (k, v) in patch.iter().filter(|(k, _)| k.as_str() != ID_PROPERTY) {
                resource.insert(k.clone(), v.clone());
            }
            encode_resource(&mut out, &resource)?;
        } else {
            out.extend_from_slice(raw.raw());
        }
    }
    if !found {
        return Err(ResourceError::IdNotFound(id.to_string()));
    }
    out.push(END);
    Ok(out)
}

/// Drops every resource whose id is in `ids`. Removing the last resource
/// yields the zero-length empty list.
pub fn delete_by_ids(data: &[u8], ids: &HashSet<&str>) -> Result<Vec<u8>, ResourceError> {
    let mut kept = Vec::new();
    for raw in walk(data)? {
        let raw = raw?;
        let drop = std::str::from_utf8(raw.id()).map(|id| ids.contains(id)).unwrap_or(false);
        if !drop {
            kept.push(raw.raw());
        }
    }
    Ok(join_spans(kept))
}

/// Appends `additions` after the resources of `data`, preserving order.
///
/// Resources lacking `_id` get a fresh UUID; existing ids are kept. Returns
/// the new stream and the ids of the appended resources.
pub fn append_resources(data: &[u8], additions: Vec<Resource>) -> Result<(Vec<u8>, Vec<String>), ResourceError> {
    let mut spans = Vec::new();
    for raw in walk(data)? {
        spans.push(raw?.raw());
    }
    let mut out = join_spans(spans);
    out.pop();
    let mut ids = Vec::with_capacity(additions.len());
    for mut resource in additions {
        let id = resource
            .entry(ID_PROPERTY.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        if !out.is_empty() {
            out.extend_from_slice(&RESOURCE_SEP);
        }
        encode_resource(&mut out, &resource)?;
        ids.push(id);
    }
    if !out.is_empty() {
        out.push(END);
    }
    Ok((out, ids))
}

/// Concatenates two encoded streams.
pub fn concat(a: &[u8], b: &[u8]) -> Result<Vec<u8>, ResourceError> {
    let mut spans = Vec::new();
    for raw in walk(a)?.chain(walk(b)?) {
        spans.push(raw?.raw());
    }
    Ok(join_spans(spans))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn res(pairs: &[(&str, &str)]) -> Resource {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_marshal_layout() {
        let list = vec![
            res(&[("_id", "a"), ("k", "v"), ("x", "y")]),
            res(&[("_id", "b")]),
        ];
        let bytes = marshal(&list).unwrap();
        assert_eq!(bytes, b"a\x00k\x01v\x01\x01x\x01y\x01\x01\x01b\x00\x02".to_vec());
        assert_eq!(unmarshal(&bytes).unwrap(), list);
    }

    #[test]
    fn test_empty_value_sentinel() {
        let list = vec![res(&[("_id", "u"), ("k1", ""), ("k2", "v")])];
        let bytes = marshal(&list).unwrap();
        assert_eq!(bytes, b"u\x00k1\x01\x03\x01\x01k2\x01v\x02".to_vec());
        let back = unmarshal(&bytes).unwrap();
        assert_eq!(back[0].get("k1").map(String::as_str), Some(""));
        assert_eq!(back, list);
    }

    #[test]
    fn test_empty_list() {
        assert_eq!(marshal(&[]), Err(ResourceError::Empty));
        assert_eq!(marshal_or_empty(&[]).unwrap(), Vec::<u8>::new());
        assert!(unmarshal(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_bad_tokens() {
        assert_eq!(marshal(&[res(&[("k", "v")])]), Err(ResourceError::MissingId));
        assert!(matches!(marshal(&[res(&[("_id", "a"), ("k", "v\x01")])]), Err(ResourceError::InvalidFormat(_))));
        assert!(matches!(marshal(&[res(&[("_id", "a"), ("", "v")])]), Err(ResourceError::InvalidFormat(_))));
    }

    #[test]
    fn test_rejects_corrupt_streams() {
        for bad in [
            &b"a\x00k\x01v"[..],
            b"a\x00k\x01v\x01\x01\x01\x01b\x00\x02",
            b"a\x00kv\x02",
            b"\x00k\x01v\x02",
            b"a\x00k\x01v\x01\x01\x01\x02",
            b"a\x00k\x01\x02",
            b"\x02",
        ] {
            assert!(unmarshal(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_update_by_id() {
        let list = vec![res(&[("_id", "a"), ("k", "1")]), res(&[("_id", "b"), ("k", "2")])];
        let bytes = marshal(&list).unwrap();
        let patched = update_by_id(&bytes, "b", &res(&[("k", "3"), ("n", ""), ("_id", "zzz")])).unwrap();
        let back = unmarshal(&patched).unwrap();
        assert_eq!(back[0], list[0]);
        assert_eq!(back[1], res(&[("_id", "b"), ("k", "3"), ("n", "")]));
        assert_eq!(update_by_id(&bytes, "c", &Resource::new()), Err(ResourceError::IdNotFound("c".into())));
    }

    #[test]
    fn test_delete_by_ids() {
        let list = vec![res(&[("_id", "a")]), res(&[("_id", "b")]), res(&[("_id", "c")])];
        let bytes = marshal(&list).unwrap();
        let out = delete_by_ids(&bytes, &HashSet::from(["a", "c"])).unwrap();
        assert_eq!(unmarshal(&out).unwrap(), vec![list[1].clone()]);
        let out = delete_by_ids(&out, &HashSet::from(["b"])).unwrap();
        assert!(out.is_empty());
        let out = delete_by_ids(&bytes, &HashSet::from(["zz"])).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn test_append_assigns_missing_ids() {
        let existing = marshal(&[res(&[("_id", "a"), ("k", "1")])]).unwrap();
        let (out, ids) = append_resources(&existing, vec![res(&[("k", "2")]), res(&[("_id", "keep"), ("k", "3")])])
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert!(Uuid::parse_str(&ids[0]).is_ok());
        assert_eq!(ids[1], "keep");
        let back = unmarshal(&out).unwrap();
        let order: Vec<&str> = back.iter().map(|r| r["k"].as_str()).collect();
        assert_eq!(order, vec!["1", "2", "3"]);

        let (out, ids) = append_resources(&[], vec![res(&[("_id", "x")])]).unwrap();
        assert_eq!(ids, vec!["x".to_string()]);
        assert_eq!(out, b"x\x00\x02".to_vec());
    }

    #[test]
    fn test_concat() {
        let a = marshal(&[res(&[("_id", "a")])]).unwrap();
        let b = marshal(&[res(&[("_id", "b")])]).unwrap();
        let ab = concat(&a, &b).unwrap();
        assert_eq!(count(&ab).unwrap(), 2);
        assert_eq!(concat(&[], &b).unwrap(), b);
        assert!(concat(&[], &[]).unwrap().is_empty());
    }

    #[test]
    fn test_raw_get() {
        let bytes = marshal(&[res(&[("_id", "a"), ("hostname", "h1"), ("ip", "")])]).unwrap();
        let raw = walk(&bytes).unwrap().next().unwrap().unwrap();
        assert_eq!(raw.get(b"_id").unwrap(), Some(&b"a"[..]));
        assert_eq!(raw.get(b"hostname").unwrap(), Some(&b"h1"[..]));
        assert_eq!(raw.get(b"ip").unwrap(), Some(&b""[..]));
        assert_eq!(raw.get(b"none").unwrap(), None);
    }

    fn arb_list() -> impl Strategy<Value = ResourceList> {
        let props = prop::collection::btree_map("[a-z][a-z0-9_]{0,6}", "[ -~]{0,8}", 0..5);
        prop::collection::vec(props, 1..6).prop_map(|all| {
            all.into_iter()
                .enumerate()
                .map(|(i, mut props)| {
                    props.remove(ID_PROPERTY);
                    props.insert(ID_PROPERTY.to_string(), format!("id-{i}"));
                    props
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_round_trip(list in arb_list()) {
            let bytes = marshal(&list).unwrap();
            prop_assert_eq!(unmarshal(&bytes).unwrap(), list);
        }

        #[test]
        fn prop_delete_removes_exactly_one(list in arb_list(), pick in any::<prop::sample::Index>()) {
            let victim = pick.index(list.len());
            let id = list[victim][ID_PROPERTY].clone();
            let bytes = marshal(&list).unwrap();
            let out = delete_by_ids(&bytes, &HashSet::from([id.as_str()])).unwrap();
            let mut expected = list.clone();
            expected.remove(victim);
            prop_assert_eq!(unmarshal(&out).unwrap(), expected);
        }
    }
}
