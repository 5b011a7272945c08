//! Syncable record model shared by every entity kind

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Prefix carried by client-generated ids until the authority assigns a real one
pub const TEMP_ID_PREFIX: &str = "tmp_";

/// Domain record kinds kept in the local store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Category,
    HiddenCategory,
    CategoryOrder,
    Entry,
    Debt,
    Goal,
}

impl EntityKind {
    /// Order in which kinds are pushed and pulled.
    ///
    /// Categories go first so entries referencing a freshly created category
    /// already point at its authority id when they are pushed.
    pub const SYNC_ORDER: [Self; 6] = [
        Self::Category,
        Self::HiddenCategory,
        Self::CategoryOrder,
        Self::Entry,
        Self::Debt,
        Self::Goal,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::HiddenCategory => "hidden_category",
            Self::CategoryOrder => "category_order",
            Self::Entry => "entry",
            Self::Debt => "debt",
            Self::Goal => "goal",
        }
    }

    /// Local table holding records of this kind
    pub const fn table(self) -> &'static str {
        match self {
            Self::Category => "custom_categories",
            Self::HiddenCategory => "hidden_categories",
            Self::CategoryOrder => "category_orders",
            Self::Entry => "ledger_entries",
            Self::Debt => "debts",
            Self::Goal => "goals",
        }
    }

    /// Table name on the remote authority
    pub const fn remote_table(self) -> &'static str {
        self.table()
    }

    /// Data fields a record of this kind must carry
    pub const fn required_fields(self) -> &'static [&'static str] {
        match self {
            Self::Category => &["name"],
            Self::HiddenCategory => &["category_id"],
            Self::CategoryOrder => &["category_id", "position"],
            Self::Entry => &["amount_cents", "direction", "occurred_on"],
            Self::Debt => &["counterparty", "amount_cents"],
            Self::Goal => &["name", "target_cents"],
        }
    }

    /// Data fields mirrored into indexed columns for filtering
    pub const fn index_columns(self) -> &'static [&'static str] {
        match self {
            Self::Category => &["name"],
            Self::HiddenCategory | Self::CategoryOrder => &["category_id"],
            Self::Entry => &["occurred_on", "category_id"],
            Self::Debt => &["due_date", "counterparty"],
            Self::Goal => &["target_date"],
        }
    }

    /// Whether records of this kind point at a category by id
    pub fn references_category(self) -> bool {
        self.index_columns().contains(&"category_id")
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::SYNC_ORDER
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| Error::InvalidInput(format!("Unknown entity kind: {s}")))
    }
}

/// Sync state of a local record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
    /// Reserved; no current flow produces it
    Conflict,
    Error,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Conflict => "conflict",
            Self::Error => "error",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "synced" => Ok(Self::Synced),
            "pending" => Ok(Self::Pending),
            "conflict" => Ok(Self::Conflict),
            "error" => Ok(Self::Error),
            other => Err(Error::InvalidInput(format!("Unknown sync status: {other}"))),
        }
    }
}

/// Record identifier, either client-generated (temporary) or authority-assigned
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordId(String);

impl RecordId {
    /// Create a new temporary id (`tmp_<uuid v7>`)
    #[must_use]
    pub fn temporary() -> Self {
        Self(format!("{TEMP_ID_PREFIX}{}", Uuid::now_v7()))
    }

    /// Wrap an id assigned by the remote authority
    pub fn authority(id: impl Into<String>) -> Result<Self> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(Error::InvalidInput("Authority id must not be empty".into()));
        }
        if id.starts_with(TEMP_ID_PREFIX) {
            return Err(Error::InvalidInput(format!(
                "Authority id must not use the temporary prefix: {id}"
            )));
        }
        Ok(Self(id))
    }

    /// Whether this id was generated locally and never confirmed
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RecordId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("Record id must not be empty".into()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for RecordId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RecordId> for String {
    fn from(value: RecordId) -> Self {
        value.0
    }
}

/// Tenant identifier scoping every record and remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(Uuid);

impl OwnerId {
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OwnerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

/// A syncable record: the base sync fields plus the kind-specific data object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub id: RecordId,
    pub owner_id: OwnerId,
    pub kind: EntityKind,
    pub sync_status: SyncStatus,
    /// Local clock (Unix ms) of the last accepted change
    pub local_updated_at: i64,
    /// Authority clock (Unix ms) of the last confirmed write
    pub server_updated_at: Option<i64>,
    pub version: i64,
    /// Tombstone flag
    pub is_deleted: bool,
    pub last_error: Option<String>,
    pub data: Map<String, Value>,
}

impl SyncRecord {
    /// Create a record that only exists locally so far
    #[must_use]
    pub fn new_local(kind: EntityKind, owner_id: OwnerId, data: Map<String, Value>) -> Self {
        Self {
            id: RecordId::temporary(),
            owner_id,
            kind,
            sync_status: SyncStatus::Pending,
            local_updated_at: crate::util::now_ms(),
            server_updated_at: None,
            version: 1,
            is_deleted: false,
            last_error: None,
            data,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.sync_status == SyncStatus::Pending
    }

    /// Text value of an indexed data field, as stored in its column
    pub fn index_value(&self, column: &str) -> Option<String> {
        match self.data.get(column)? {
            Value::Null => None,
            Value::String(value) => Some(value.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Check that the record is well-formed for its kind
    pub fn validate(&self) -> Result<()> {
        if self.version < 1 {
            return Err(Error::InvalidInput(format!(
                "{} {} has invalid version {}",
                self.kind, self.id, self.version
            )));
        }
        let missing = self
            .kind
            .required_fields()
            .iter()
            .filter(|field| !matches!(self.data.get(**field), Some(value) if !value.is_null()))
            .copied()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(Error::InvalidInput(format!(
                "{} {} is missing required fields: {}",
                self.kind,
                self.id,
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Mark a local mutation: bump version, stamp local clock, flag pending
    pub fn touch(&mut self, now: i64) {
        self.version += 1;
        self.local_updated_at = now;
        self.sync_status = SyncStatus::Pending;
    }
}
