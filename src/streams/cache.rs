use crate::config::StreamsCacheConfig;
use crate::error::MtdbError;
use crate::model::stream::{
    GetRecordsRequest, GetRecordsResponse, GetShardIteratorRequest, GetShardIteratorResponse,
    ShardIteratorKind, StreamRecord,
};
use crate::store::StreamsClient;
use async_trait::async_trait;
use compact_str::CompactString;
use parking_lot::RwLock;
use primitive_types::U256;
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Documented maximum records per shard-read result; merged segments never
/// exceed it.
const MAX_MERGED_RECORDS: usize = 1000;

const FIELD_SEPARATOR: char = '/';
const FIELD_ESCAPE: char = '\\';

fn parse_sequence(text: &str) -> Result<U256, MtdbError> {
    U256::from_dec_str(text)
        .map_err(|_| MtdbError::MalformedIterator(format!("bad sequence number '{text}'")))
}

fn record_sequence(record: &StreamRecord) -> Result<U256, MtdbError> {
    parse_sequence(&record.sequence_number)
}

/// A position in a stream shard. Total order is lexicographic on
/// `(stream_arn, shard_id, sequence_number)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IteratorPosition {
    stream_arn: CompactString,
    shard_id: CompactString,
    sequence_number: U256,
}

impl IteratorPosition {
    fn equals_shard(&self, other: &IteratorPosition) -> bool {
        self.stream_arn == other.stream_arn && self.shard_id == other.shard_id
    }

    fn at(&self, sequence_number: U256) -> IteratorPosition {
        IteratorPosition {
            stream_arn: self.stream_arn.clone(),
            shard_id: self.shard_id.clone(),
            sequence_number,
        }
    }
}

fn next_sequence(sequence_number: U256) -> U256 {
    sequence_number
        .checked_add(U256::one())
        .unwrap_or_else(U256::max_value)
}

// ---------------------------------------------------------------------------
// external iterators
// ---------------------------------------------------------------------------

/// The opaque iterator handed to clients. It carries enough context to
/// locate the cache segment on the next `get_records` call without any
/// server-side state, plus the underlying iterator when one has been
/// acquired. Embedded underlying iterators expire after 15 minutes on the
/// server side; callers restart from an absolute position after expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalIterator {
    stream_arn: CompactString,
    shard_id: CompactString,
    kind: ShardIteratorKind,
    sequence_number: Option<CompactString>,
    parsed_sequence: Option<U256>,
    underlying: Option<String>,
}

impl ExternalIterator {
    fn new(
        stream_arn: CompactString,
        shard_id: CompactString,
        kind: ShardIteratorKind,
        sequence_number: Option<CompactString>,
        underlying: Option<String>,
    ) -> Result<Self, MtdbError> {
        let parsed_sequence = match (kind.is_absolute(), &sequence_number) {
            (true, Some(text)) => Some(parse_sequence(text)?),
            (true, None) => {
                return Err(MtdbError::Validation(format!(
                    "iterator type {kind} requires a sequence number"
                )));
            }
            (false, Some(_)) => {
                return Err(MtdbError::Validation(format!(
                    "iterator type {kind} does not take a sequence number"
                )));
            }
            (false, None) => None,
        };
        Ok(Self {
            stream_arn,
            shard_id,
            kind,
            sequence_number,
            parsed_sequence,
            underlying,
        })
    }

    fn from_request(
        request: &GetShardIteratorRequest,
        underlying: Option<String>,
    ) -> Result<Self, MtdbError> {
        Self::new(
            request.stream_arn.clone(),
            request.shard_id.clone(),
            request.kind,
            request.sequence_number.clone(),
            underlying,
        )
    }

    fn after_sequence(
        stream_arn: CompactString,
        shard_id: CompactString,
        sequence_number: &str,
        underlying: Option<String>,
    ) -> Self {
        // the sequence number comes from a record, so it parses
        Self::new(
            stream_arn,
            shard_id,
            ShardIteratorKind::AfterSequenceNumber,
            Some(sequence_number.into()),
            underlying,
        )
        .expect("record sequence numbers are valid")
    }

    /// Fixed field order: stream arn, shard id, type, sequence number or
    /// `null`, underlying iterator or `null`.
    pub fn format(&self) -> String {
        let fields = [
            self.stream_arn.as_str(),
            self.shard_id.as_str(),
            self.kind.as_str(),
            self.sequence_number.as_deref().unwrap_or("null"),
            self.underlying.as_deref().unwrap_or("null"),
        ];
        let mut out = String::new();
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                out.push(FIELD_SEPARATOR);
            }
            for c in field.chars() {
                if c == FIELD_SEPARATOR || c == FIELD_ESCAPE {
                    out.push(FIELD_ESCAPE);
                }
                out.push(c);
            }
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self, MtdbError> {
        let mut fields = Vec::with_capacity(5);
        let mut current = String::new();
        let mut chars = text.chars();
        while let Some(c) = chars.next() {
            if c == FIELD_ESCAPE {
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => {
                        return Err(MtdbError::MalformedIterator(
                            "dangling escape character".to_string(),
                        ));
                    }
                }
            } else if c == FIELD_SEPARATOR {
                fields.push(std::mem::take(&mut current));
            } else {
                current.push(c);
            }
        }
        fields.push(current);

        if fields.len() != 5 {
            return Err(MtdbError::MalformedIterator(format!(
                "expected 5 fields, found {}",
                fields.len()
            )));
        }
        let nullable = |s: &str| {
            if s == "null" {
                None
            } else {
                Some(s.to_string())
            }
        };
        Self::new(
            fields[0].as_str().into(),
            fields[1].as_str().into(),
            ShardIteratorKind::parse(&fields[2])?,
            nullable(&fields[3]).map(CompactString::from),
            nullable(&fields[4]),
        )
    }

    /// The shard position of an absolute iterator; logical iterators have
    /// no position until records are observed.
    fn resolve_position(&self) -> Option<IteratorPosition> {
        let sequence_number = self.parsed_sequence?;
        let sequence_number = match self.kind {
            ShardIteratorKind::AtSequenceNumber => sequence_number,
            ShardIteratorKind::AfterSequenceNumber => next_sequence(sequence_number),
            _ => return None,
        };
        Some(IteratorPosition {
            stream_arn: self.stream_arn.clone(),
            shard_id: self.shard_id.clone(),
            sequence_number,
        })
    }

    /// The position of this iterator relative to the first record the
    /// underlying stream returned for it.
    fn position_with(&self, first_record: &StreamRecord) -> Result<IteratorPosition, MtdbError> {
        match self.resolve_position() {
            Some(position) => Ok(position),
            None => Ok(IteratorPosition {
                stream_arn: self.stream_arn.clone(),
                shard_id: self.shard_id.clone(),
                sequence_number: record_sequence(first_record)?,
            }),
        }
    }

    fn to_request(&self) -> GetShardIteratorRequest {
        GetShardIteratorRequest {
            stream_arn: self.stream_arn.clone(),
            shard_id: self.shard_id.clone(),
            kind: self.kind,
            sequence_number: self.sequence_number.clone(),
        }
    }

    fn with_underlying(mut self, underlying: String) -> Self {
        self.underlying = Some(underlying);
        self
    }

    pub fn stream_arn(&self) -> &str {
        &self.stream_arn
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }
}

// ---------------------------------------------------------------------------
// the cache
// ---------------------------------------------------------------------------

/// A cached run of contiguous records for one shard. Always non-empty; the
/// optional next iterator is stored in external form.
#[derive(Debug, Clone)]
struct CacheSegment {
    records: Vec<StreamRecord>,
    next_iterator: Option<String>,
}

impl CacheSegment {
    fn last_sequence(&self) -> Result<U256, MtdbError> {
        record_sequence(self.records.last().expect("segments are non-empty"))
    }
}

#[derive(Default)]
struct SegmentCache {
    segments: BTreeMap<IteratorPosition, CacheSegment>,
    eviction: VecDeque<IteratorPosition>,
}

/// Inspection view of one cached segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub stream_arn: CompactString,
    pub shard_id: CompactString,
    pub start_sequence_number: CompactString,
    pub first_record_sequence_number: CompactString,
    pub last_record_sequence_number: CompactString,
    pub record_count: usize,
    pub next_iterator: Option<String>,
}

/// Streams adapter that bins and caches contiguous record segments per
/// `(stream, shard)` so overlapping readers share one underlying read.
///
/// Invariants, preserved by construction under the write lock:
/// 1. every cached segment contains at least one record;
/// 2. segments on the same shard never overlap.
///
/// Underlying calls are made with no lock held; only in-memory map updates
/// happen under the write lock.
pub struct CachingStreams {
    streams: Arc<dyn StreamsClient>,
    config: StreamsCacheConfig,
    cache: RwLock<SegmentCache>,
}

impl CachingStreams {
    pub fn new(streams: Arc<dyn StreamsClient>, config: StreamsCacheConfig) -> Self {
        Self {
            streams,
            config,
            cache: RwLock::new(SegmentCache::default()),
        }
    }

    /// Issues an opaque external iterator. Logical iterators acquire their
    /// underlying iterator eagerly: deferring would let `LATEST` drift past
    /// records the client expects to see. Absolute iterators defer
    /// acquisition since a cache hit may make it unnecessary.
    pub async fn get_shard_iterator(
        &self,
        request: &GetShardIteratorRequest,
    ) -> Result<GetShardIteratorResponse, MtdbError> {
        let underlying = if request.kind.is_absolute() {
            None
        } else {
            Some(self.streams.get_shard_iterator(request).await?.shard_iterator)
        };
        let iterator = ExternalIterator::from_request(request, underlying)?;
        Ok(GetShardIteratorResponse {
            shard_iterator: iterator.format(),
        })
    }

    pub async fn get_records(
        &self,
        request: &GetRecordsRequest,
    ) -> Result<GetRecordsResponse, MtdbError> {
        if request.limit == Some(0) {
            return Err(MtdbError::Validation("limit must be positive".to_string()));
        }
        let iterator = ExternalIterator::parse(&request.shard_iterator)?;
        let loaded = self.load_records(iterator.clone()).await?;
        Ok(apply_limit(request.limit, &iterator, loaded))
    }

    async fn load_records(
        &self,
        mut iterator: ExternalIterator,
    ) -> Result<GetRecordsResponse, MtdbError> {
        let mut attempt: u32 = 0;
        while attempt < self.config.max_retries {
            if let Some(position) = iterator.resolve_position()
                && let Some(hit) = self.lookup(&position)
            {
                debug!(
                    shard = %position.shard_id,
                    records = hit.records.len(),
                    "get_records cache hit"
                );
                return Ok(hit);
            }

            if iterator.underlying.is_none() {
                debug!(shard = %iterator.shard_id, "loading underlying shard iterator");
                let response = self.streams.get_shard_iterator(&iterator.to_request()).await?;
                iterator.underlying = Some(response.shard_iterator);
            }
            let underlying = iterator
                .underlying
                .clone()
                .expect("underlying iterator was just loaded");

            let loaded = match self
                .streams
                .get_records(&GetRecordsRequest::new(underlying))
                .await
            {
                Ok(loaded) => loaded,
                Err(MtdbError::LimitExceeded) => {
                    let backoff = self.config.backoff_ms * (u64::from(attempt) + 1);
                    warn!(attempt, backoff_ms = backoff, "shard read throttled, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                    continue;
                }
                Err(other) => return Err(other),
            };

            // Empty results never touch the cache: segments stay non-empty.
            // The loaded iterator is kept so the client proceeds through
            // the shard on its next call.
            if loaded.records.is_empty() {
                return Ok(match loaded.next_shard_iterator {
                    None => GetRecordsResponse::default(),
                    Some(next) => GetRecordsResponse {
                        records: Vec::new(),
                        next_shard_iterator: Some(iterator.with_underlying(next).format()),
                    },
                });
            }

            let position = iterator.position_with(&loaded.records[0])?;
            let result = {
                let mut cache = self.cache.write();
                cache.insert_with_merge(&position, loaded, self.config.max_segments)?;
                // Re-read through the index: the stored segment may have
                // been merged with neighbors.
                lookup_in(&cache, &position)
                    .ok_or_else(|| MtdbError::Store("cached segment vanished".to_string()))?
            };
            return Ok(result);
        }

        warn!(
            max_retries = self.config.max_retries,
            "get_records exhausted its retry budget"
        );
        Err(MtdbError::LimitExceeded)
    }

    fn lookup(&self, position: &IteratorPosition) -> Option<GetRecordsResponse> {
        let cache = self.cache.read();
        lookup_in(&cache, position)
    }

    /// Snapshot of the cached segments, for diagnostics.
    pub fn cached_segments(&self) -> Vec<SegmentInfo> {
        let cache = self.cache.read();
        cache
            .segments
            .iter()
            .map(|(position, segment)| SegmentInfo {
                stream_arn: position.stream_arn.clone(),
                shard_id: position.shard_id.clone(),
                start_sequence_number: position.sequence_number.to_string().into(),
                first_record_sequence_number: segment.records[0].sequence_number.clone(),
                last_record_sequence_number: segment
                    .records
                    .last()
                    .expect("segments are non-empty")
                    .sequence_number
                    .clone(),
                record_count: segment.records.len(),
                next_iterator: segment.next_iterator.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl StreamsClient for CachingStreams {
    async fn get_shard_iterator(
        &self,
        request: &GetShardIteratorRequest,
    ) -> Result<GetShardIteratorResponse, MtdbError> {
        CachingStreams::get_shard_iterator(self, request).await
    }

    async fn get_records(
        &self,
        request: &GetRecordsRequest,
    ) -> Result<GetRecordsResponse, MtdbError> {
        CachingStreams::get_records(self, request).await
    }
}

/// Matches a position against the segment index: exact segment hit, or the
/// suffix of the greatest segment at or before it that still covers it.
fn lookup_in(cache: &SegmentCache, position: &IteratorPosition) -> Option<GetRecordsResponse> {
    let (key, segment) = cache.segments.range(..=position.clone()).next_back()?;
    if !key.equals_shard(position) {
        return None;
    }
    if key == position {
        return Some(GetRecordsResponse {
            records: segment.records.clone(),
            next_shard_iterator: segment.next_iterator.clone(),
        });
    }
    let last = segment.last_sequence().ok()?;
    if position.sequence_number <= last {
        let records = segment
            .records
            .iter()
            .filter(|record| {
                record_sequence(record)
                    .map(|seq| position.sequence_number <= seq)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        return Some(GetRecordsResponse {
            records,
            next_shard_iterator: segment.next_iterator.clone(),
        });
    }
    None
}

impl SegmentCache {
    /// Inserts a loaded result at `position`, trimming overlap against both
    /// neighbors and merging with adjacent segments up to the record cap.
    /// Preserves both cache invariants.
    fn insert_with_merge(
        &mut self,
        position: &IteratorPosition,
        loaded: GetRecordsResponse,
        max_segments: usize,
    ) -> Result<(), MtdbError> {
        let mut cache_pos = position.clone();
        let mut records = loaded.records;
        let loaded_last = record_sequence(records.last().expect("caller checked non-empty"))?;
        let mut next_iterator = loaded.next_shard_iterator.map(|underlying| {
            ExternalIterator::after_sequence(
                position.stream_arn.clone(),
                position.shard_id.clone(),
                &loaded_last.to_string(),
                Some(underlying),
            )
            .format()
        });

        // predecessor: trim or note adjacency
        let mut merge_pred: Option<IteratorPosition> = None;
        let pred_key = self
            .segments
            .range(..=cache_pos.clone())
            .next_back()
            .map(|(key, _)| key.clone());
        if let Some(pred_key) = pred_key
            && pred_key.equals_shard(&cache_pos)
        {
            let pred_last = self.segments[&pred_key].last_sequence()?;
            if cache_pos.sequence_number <= pred_last {
                cache_pos = cache_pos.at(next_sequence(pred_last));
                trim_before(&mut records, cache_pos.sequence_number)?;
                if records.is_empty() {
                    // everything was already cached in the predecessor
                    return Ok(());
                }
                merge_pred = Some(pred_key);
            } else if next_sequence(pred_last) == cache_pos.sequence_number {
                merge_pred = Some(pred_key);
            }
        }

        // successor: trim, re-index, or note adjacency
        let mut merge_succ: Option<IteratorPosition> = None;
        let succ_key = self
            .segments
            .range((Bound::Excluded(cache_pos.clone()), Bound::Unbounded))
            .next()
            .map(|(key, _)| key.clone());
        if let Some(succ_key) = succ_key
            && succ_key.equals_shard(&cache_pos)
        {
            let new_last = record_sequence(records.last().expect("non-empty"))?;
            if succ_key.sequence_number <= new_last {
                trim_from(&mut records, succ_key.sequence_number)?;
                if records.is_empty() {
                    // fully contained in the successor: re-index it at the
                    // (possibly earlier) loaded position
                    let succ = self
                        .segments
                        .remove(&succ_key)
                        .expect("successor key just observed");
                    records = succ.records;
                    next_iterator = succ.next_iterator;
                } else {
                    let trimmed_last = record_sequence(records.last().expect("non-empty"))?;
                    next_iterator = Some(
                        ExternalIterator::after_sequence(
                            cache_pos.stream_arn.clone(),
                            cache_pos.shard_id.clone(),
                            &trimmed_last.to_string(),
                            None,
                        )
                        .format(),
                    );
                    merge_succ = Some(succ_key);
                }
            } else if succ_key.sequence_number == next_sequence(new_last) {
                merge_succ = Some(succ_key);
            }
        }

        // merge with the predecessor, keeping its key so earlier readers
        // still hit the combined segment
        if let Some(pred_key) = merge_pred {
            let pred_len = self.segments[&pred_key].records.len();
            if pred_len + records.len() <= MAX_MERGED_RECORDS {
                let pred = self
                    .segments
                    .remove(&pred_key)
                    .expect("predecessor key just observed");
                let mut merged = pred.records;
                merged.extend(records);
                records = merged;
                cache_pos = pred_key;
            }
        }
        if let Some(succ_key) = merge_succ {
            let succ_len = self.segments[&succ_key].records.len();
            if records.len() + succ_len <= MAX_MERGED_RECORDS {
                let succ = self
                    .segments
                    .remove(&succ_key)
                    .expect("successor key just observed");
                records.extend(succ.records);
                next_iterator = succ.next_iterator;
            }
        }

        self.segments.insert(
            cache_pos.clone(),
            CacheSegment {
                records,
                next_iterator,
            },
        );
        self.eviction.push_back(cache_pos);
        while self.segments.len() > max_segments {
            match self.eviction.pop_front() {
                Some(oldest) => {
                    self.segments.remove(&oldest);
                }
                None => break,
            }
        }
        Ok(())
    }
}

/// Keeps records with sequence number at or past `bound`.
fn trim_before(records: &mut Vec<StreamRecord>, bound: U256) -> Result<(), MtdbError> {
    let mut keep = Vec::with_capacity(records.len());
    for record in records.drain(..) {
        if record_sequence(&record)? >= bound {
            keep.push(record);
        }
    }
    *records = keep;
    Ok(())
}

/// Keeps records with sequence number strictly before `bound`.
fn trim_from(records: &mut Vec<StreamRecord>, bound: U256) -> Result<(), MtdbError> {
    let mut keep = Vec::with_capacity(records.len());
    for record in records.drain(..) {
        if record_sequence(&record)? < bound {
            keep.push(record);
        }
    }
    *records = keep;
    Ok(())
}

/// Applies the caller's limit to a loaded result. The cache itself is
/// unaffected; the returned next iterator restarts right after the prefix.
fn apply_limit(
    limit: Option<usize>,
    iterator: &ExternalIterator,
    loaded: GetRecordsResponse,
) -> GetRecordsResponse {
    match limit {
        Some(limit) if limit < loaded.records.len() => {
            let records: Vec<StreamRecord> = loaded.records[..limit].to_vec();
            let last = records
                .last()
                .expect("limit is positive")
                .sequence_number
                .clone();
            let next = ExternalIterator::after_sequence(
                iterator.stream_arn.clone(),
                iterator.shard_id.clone(),
                &last,
                None,
            );
            GetRecordsResponse {
                records,
                next_shard_iterator: Some(next.format()),
            }
        }
        _ => loaded,
    }
}
