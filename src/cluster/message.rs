//! Forwarding wire format.
//!
//! A follower opens one connection per request, writes a single JSON
//! [`Message`] tagged by `type`, shuts down its write half, and reads one
//! JSON [`Response`] back. Byte fields travel as base64.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::error::RegistryError;
use crate::error::Result;
use crate::store::Row;
use crate::store::types::b64;

/// Opcodes understood by the forwarding service.
pub const OPCODES: &[&str] = &["peer", "createrBucket", "removeBucket", "update", "batch", "join", "remove"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "peer")]
    Peer { peers: BTreeMap<String, String> },

    #[serde(rename = "createrBucket")]
    CreateBucket {
        #[serde(with = "b64")]
        name: Vec<u8>,
        #[serde(default)]
        if_not_exist: bool,
    },

    #[serde(rename = "removeBucket")]
    RemoveBucket {
        #[serde(with = "b64")]
        name: Vec<u8>,
    },

    #[serde(rename = "update")]
    Update {
        #[serde(with = "b64")]
        bucket: Vec<u8>,
        #[serde(with = "b64")]
        key: Vec<u8>,
        #[serde(with = "b64")]
        value: Vec<u8>,
    },

    #[serde(rename = "batch")]
    Batch { rows: Vec<Row> },

    #[serde(rename = "join")]
    Join { addr: String },

    #[serde(rename = "remove")]
    Remove { addr: String },
}

impl Message {
    pub fn opcode(&self) -> &'static str {
        match self {
            Message::Peer { .. } => "peer",
            Message::CreateBucket { .. } => "createrBucket",
            Message::RemoveBucket { .. } => "removeBucket",
            Message::Update { .. } => "update",
            Message::Batch { .. } => "batch",
            Message::Join { .. } => "join",
            Message::Remove { .. } => "remove",
        }
    }
}

/// `{code, message}`; code 0 is success, otherwise [`RegistryError::code`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            code: 0,
            message: String::new(),
        }
    }

    pub fn from_result(result: &Result<()>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(err) => Self {
                code: err.code(),
                message: err.detail(),
            },
        }
    }

    pub fn into_result(self) -> Result<()> {
        match RegistryError::from_code(self.code, self.message) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}
