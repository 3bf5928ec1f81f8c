//! Read-only lookup table from `(direction, header)` to message identity and layout.
//!
//! The table is produced offline by whatever analyses the target application;
//! this module only stores and queries it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::fields::FieldKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Server to client.
    Incoming,
    /// Client to server.
    Outgoing,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Incoming, Direction::Outgoing];

    pub fn lane(self) -> &'static str {
        match self {
            Direction::Incoming => "server->client",
            Direction::Outgoing => "client->server",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Direction::Incoming => 0,
            Direction::Outgoing => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.lane())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageInfo {
    pub header: u16,
    pub hash: Arc<str>,
    pub layout: Option<Arc<[FieldKind]>>,
}

impl MessageInfo {
    pub fn new(header: u16, hash: impl Into<Arc<str>>, layout: Option<Vec<FieldKind>>) -> Self {
        Self {
            header,
            hash: hash.into(),
            layout: layout.map(Arc::from),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    incoming: Vec<CatalogEntry>,
    #[serde(default)]
    outgoing: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    header: u16,
    #[serde(default)]
    hash: String,
    #[serde(default)]
    layout: Option<Vec<FieldKind>>,
}

#[derive(Debug, Clone, Default)]
pub struct MessageCatalog {
    messages: [HashMap<u16, MessageInfo>; 2],
}

impl MessageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the JSON export of an offline catalog run:
    /// `{"incoming": [{"header", "hash", "layout"}], "outgoing": [...]}`.
    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        let file: CatalogFile = serde_json::from_str(text).context("Failed to parse catalog JSON")?;
        let mut catalog = Self::new();
        for (direction, entries) in [
            (Direction::Incoming, file.incoming),
            (Direction::Outgoing, file.outgoing),
        ] {
            for entry in entries {
                catalog.insert(
                    direction,
                    MessageInfo::new(entry.header, entry.hash, entry.layout),
                );
            }
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, direction: Direction, info: MessageInfo) -> Option<MessageInfo> {
        self.messages[direction.index()].insert(info.header, info)
    }

    pub fn lookup(&self, direction: Direction, header: u16) -> Option<&MessageInfo> {
        self.messages[direction.index()].get(&header)
    }

    /// Headers get renumbered between client builds; hashes do not.
    pub fn find_by_hash(&self, direction: Direction, hash: &str) -> Option<&MessageInfo> {
        self.messages[direction.index()]
            .values()
            .find(|info| &*info.hash == hash)
    }

    pub fn len(&self) -> usize {
        self.messages.iter().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
