//! Record and event types exchanged with the upstream collaborator.
//!
//! Records are plain JSON objects keyed by application attribute name. The
//! engine never interprets attributes it has no column for, except `flow`
//! which routes error records downstream.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A record as seen by the application: attribute name to JSON value.
pub type Record = Map<String, Value>;

/// Attribute carrying the dataflow a record belongs to.
pub const FLOW_ATTRIBUTE: &str = "flow";

/// Returns the value of `attribute`, treating JSON `null` the same as absent.
pub fn attribute<'a>(record: &'a Record, attribute: &str) -> Option<&'a Value> {
    match record.get(attribute) {
        None | Some(Value::Null) => None,
        Some(value) => Some(value),
    }
}

/// Returns the `flow` attribute of a record, if any.
pub fn flow(record: &Record) -> Option<&Value> {
    attribute(record, FLOW_ATTRIBUTE)
}

/// Transaction metadata attached to a batch by the upstream source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Upstream transaction identifier.
    pub id: String,

    /// Whether more batches follow for the same transaction.
    #[serde(default)]
    pub more: bool,
}

/// Options bag accompanying every add/remove/update batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Options {
    /// Identity of the sender, used to route error records back to it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    /// Transaction metadata.
    #[serde(default, rename = "_t", skip_serializing_if = "Option::is_none")]
    pub transaction: Option<Transaction>,
}

impl Options {
    /// Options carrying only a sender identity.
    pub fn from_sender(sender: impl Into<String>) -> Self {
        Self {
            sender: Some(sender.into()),
            ..Self::default()
        }
    }

    /// Identifier of the upstream transaction, if any.
    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction.as_ref().map(|t| t.id.as_str())
    }
}

/// One update: the previous and the next state of the same record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub old: Record,
    pub new: Record,
}

impl Update {
    pub fn new(old: Record, new: Record) -> Self {
        Self { old, new }
    }

    /// Attributes among `attributes` whose value differs between old and new.
    ///
    /// A missing attribute and an explicit `null` are the same value.
    pub fn changed<'a>(&self, attributes: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
        attributes
            .into_iter()
            .filter(|a| attribute(&self.old, a) != attribute(&self.new, a))
            .collect()
    }
}

/// Upstream operation kinds, as reported in error records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Add,
    Remove,
    Update,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Add => "add",
            Operation::Remove => "remove",
            Operation::Update => "update",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
