use crate::error::MtdbError;
use crate::model::Item;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Shard iterator types accepted by the streams endpoint.
///
/// `AtSequenceNumber` and `AfterSequenceNumber` are *absolute*: their shard
/// position is fully determined by the sequence number they carry.
/// `TrimHorizon` and `Latest` are *logical*: their position depends on the
/// current shard contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardIteratorKind {
    TrimHorizon,
    Latest,
    AtSequenceNumber,
    AfterSequenceNumber,
}

impl ShardIteratorKind {
    pub fn is_absolute(self) -> bool {
        matches!(
            self,
            ShardIteratorKind::AtSequenceNumber | ShardIteratorKind::AfterSequenceNumber
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ShardIteratorKind::TrimHorizon => "TRIM_HORIZON",
            ShardIteratorKind::Latest => "LATEST",
            ShardIteratorKind::AtSequenceNumber => "AT_SEQUENCE_NUMBER",
            ShardIteratorKind::AfterSequenceNumber => "AFTER_SEQUENCE_NUMBER",
        }
    }

    pub fn parse(value: &str) -> Result<Self, MtdbError> {
        match value {
            "TRIM_HORIZON" => Ok(ShardIteratorKind::TrimHorizon),
            "LATEST" => Ok(ShardIteratorKind::Latest),
            "AT_SEQUENCE_NUMBER" => Ok(ShardIteratorKind::AtSequenceNumber),
            "AFTER_SEQUENCE_NUMBER" => Ok(ShardIteratorKind::AfterSequenceNumber),
            other => Err(MtdbError::MalformedIterator(format!(
                "unknown iterator type '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for ShardIteratorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEventKind {
    Insert,
    Modify,
    Remove,
}

/// A change record as returned by the underlying streams endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub event_id: CompactString,
    pub event_kind: StreamEventKind,
    pub sequence_number: CompactString,
    pub keys: Item,
    pub new_image: Option<Item>,
    pub old_image: Option<Item>,
}

/// A record translated back into a tenant's virtual view: the physical
/// record plus the tenant and virtual table it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantRecord {
    pub tenant_id: CompactString,
    pub table_name: CompactString,
    pub record: StreamRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetShardIteratorRequest {
    pub stream_arn: CompactString,
    pub shard_id: CompactString,
    pub kind: ShardIteratorKind,
    pub sequence_number: Option<CompactString>,
}

impl GetShardIteratorRequest {
    pub fn trim_horizon(
        stream_arn: impl Into<CompactString>,
        shard_id: impl Into<CompactString>,
    ) -> Self {
        Self {
            stream_arn: stream_arn.into(),
            shard_id: shard_id.into(),
            kind: ShardIteratorKind::TrimHorizon,
            sequence_number: None,
        }
    }

    pub fn latest(
        stream_arn: impl Into<CompactString>,
        shard_id: impl Into<CompactString>,
    ) -> Self {
        Self {
            stream_arn: stream_arn.into(),
            shard_id: shard_id.into(),
            kind: ShardIteratorKind::Latest,
            sequence_number: None,
        }
    }

    pub fn at_sequence_number(
        stream_arn: impl Into<CompactString>,
        shard_id: impl Into<CompactString>,
        sequence_number: impl Into<CompactString>,
    ) -> Self {
        Self {
            stream_arn: stream_arn.into(),
            shard_id: shard_id.into(),
            kind: ShardIteratorKind::AtSequenceNumber,
            sequence_number: Some(sequence_number.into()),
        }
    }

    pub fn after_sequence_number(
        stream_arn: impl Into<CompactString>,
        shard_id: impl Into<CompactString>,
        sequence_number: impl Into<CompactString>,
    ) -> Self {
        Self {
            stream_arn: stream_arn.into(),
            shard_id: shard_id.into(),
            kind: ShardIteratorKind::AfterSequenceNumber,
            sequence_number: Some(sequence_number.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetShardIteratorResponse {
    pub shard_iterator: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetRecordsRequest {
    pub shard_iterator: String,
    pub limit: Option<usize>,
}

impl GetRecordsRequest {
    pub fn new(shard_iterator: impl Into<String>) -> Self {
        Self {
            shard_iterator: shard_iterator.into(),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetRecordsResponse {
    pub records: Vec<StreamRecord>,
    pub next_shard_iterator: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetTenantRecordsResponse {
    pub records: Vec<TenantRecord>,
    pub next_shard_iterator: Option<String>,
}

/// A parsed stream ARN. Only the table-name segment matters here: the
/// by-table streams façade recovers `(tenant, virtual table)` from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamArn {
    pub table_name: CompactString,
    pub stream_label: CompactString,
}

impl StreamArn {
    /// Parses `.../table/{name}/stream/{label}` out of an ARN string.
    pub fn parse(arn: &str) -> Result<Self, MtdbError> {
        let mut segments = arn.split('/');
        let head = segments.next().unwrap_or_default();
        if !head.contains("table") && !head.starts_with("arn:") {
            return Err(MtdbError::Validation(format!("malformed stream arn '{arn}'")));
        }
        match (segments.next(), segments.next(), segments.next()) {
            (Some(table_name), Some("stream"), Some(label)) if !table_name.is_empty() => {
                Ok(Self {
                    table_name: table_name.into(),
                    stream_label: label.into(),
                })
            }
            _ => Err(MtdbError::Validation(format!("malformed stream arn '{arn}'"))),
        }
    }
}
