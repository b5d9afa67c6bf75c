mod support;

use mtdb::config::StreamsCacheConfig;
use mtdb::error::MtdbError;
use mtdb::model::stream::{GetRecordsRequest, GetShardIteratorRequest};
use mtdb::streams::CachingStreams;
use std::sync::Arc;
use support::{ScriptedStreams, make_records};

const ARN: &str = "arn:aws:dynamodb:us-east-1:1:table/mt_shared_s/stream/2024";
const SHARD: &str = "shard-0001";

fn harness(config: StreamsCacheConfig) -> (Arc<ScriptedStreams>, CachingStreams) {
    let streams = Arc::new(ScriptedStreams::new());
    let cache = CachingStreams::new(streams.clone(), config);
    (streams, cache)
}

fn assert_invariants(cache: &CachingStreams) {
    let mut segments = cache.cached_segments();
    segments.sort_by(|a, b| {
        (a.stream_arn.as_str(), a.shard_id.as_str())
            .cmp(&(b.stream_arn.as_str(), b.shard_id.as_str()))
            .then_with(|| {
                a.first_record_sequence_number
                    .parse::<u128>()
                    .unwrap()
                    .cmp(&b.first_record_sequence_number.parse::<u128>().unwrap())
            })
    });
    for segment in &segments {
        assert!(segment.record_count >= 1, "empty segment cached: {segment:?}");
    }
    for pair in segments.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if a.stream_arn == b.stream_arn && a.shard_id == b.shard_id {
            let a_last: u128 = a.last_record_sequence_number.parse().unwrap();
            let b_first: u128 = b.first_record_sequence_number.parse().unwrap();
            assert!(
                a_last < b_first,
                "overlapping segments on one shard: {a:?} vs {b:?}"
            );
        }
    }
}

async fn issue_at(cache: &CachingStreams, sequence_number: &str) -> String {
    cache
        .get_shard_iterator(&GetShardIteratorRequest::at_sequence_number(
            ARN,
            SHARD,
            sequence_number,
        ))
        .await
        .expect("iterator")
        .shard_iterator
}

#[tokio::test]
async fn s5_second_reader_is_served_from_cache() {
    let (streams, cache) = harness(StreamsCacheConfig::default());
    streams.push_records(make_records(0, 50), Some("u-next"));

    let iterator = issue_at(&cache, "0").await;
    // absolute iterators defer the underlying iterator until the first miss
    assert_eq!(streams.iterator_calls(), 0);

    let a = cache
        .get_records(&GetRecordsRequest::new(iterator.clone()))
        .await
        .expect("reader A");
    assert_eq!(a.records.len(), 50);
    assert_eq!(streams.records_calls(), 1);
    assert_eq!(streams.iterator_calls(), 1);

    let b = cache
        .get_records(&GetRecordsRequest::new(iterator))
        .await
        .expect("reader B");
    assert_eq!(b.records, a.records);
    assert_eq!(b.next_shard_iterator, a.next_shard_iterator);
    assert_eq!(streams.records_calls(), 1, "no second underlying read");
    assert_eq!(streams.iterator_calls(), 1);
    assert_invariants(&cache);
}

#[tokio::test]
async fn s6_adjacent_segments_merge_and_keep_the_later_continuation() {
    let (streams, cache) = harness(StreamsCacheConfig::default());
    streams.push_records(make_records(0, 10), Some("u1"));
    streams.push_records(make_records(10, 10), Some("u2"));

    let a = issue_at(&cache, "0").await;
    cache
        .get_records(&GetRecordsRequest::new(a))
        .await
        .expect("reader A");
    let b = issue_at(&cache, "10").await;
    let b_result = cache
        .get_records(&GetRecordsRequest::new(b))
        .await
        .expect("reader B");

    let segments = cache.cached_segments();
    assert_eq!(segments.len(), 1, "segments: {segments:?}");
    assert_eq!(segments[0].first_record_sequence_number, "0");
    assert_eq!(segments[0].last_record_sequence_number, "19");
    assert_eq!(segments[0].record_count, 20);
    assert_eq!(segments[0].next_iterator, b_result.next_shard_iterator);
    assert!(
        segments[0]
            .next_iterator
            .as_deref()
            .is_some_and(|it| it.contains("u2")),
        "merged segment keeps the successor's continuation"
    );

    // a reader at the front of the merged segment sees all of it
    let again = cache
        .get_records(&GetRecordsRequest::new(issue_at(&cache, "0").await))
        .await
        .expect("merged read");
    assert_eq!(again.records.len(), 20);
    assert_eq!(streams.records_calls(), 2);
    assert_invariants(&cache);
}

#[tokio::test]
async fn s7_throttled_reads_back_off_and_retry() {
    let (streams, cache) = harness(StreamsCacheConfig::default().with_backoff_ms(1));
    streams.push_error(MtdbError::LimitExceeded);
    streams.push_error(MtdbError::LimitExceeded);
    streams.push_records(make_records(0, 10), None);

    let result = cache
        .get_records(&GetRecordsRequest::new(issue_at(&cache, "0").await))
        .await
        .expect("retried read");
    assert_eq!(result.records.len(), 10);
    assert_eq!(streams.records_calls(), 3);
    assert_invariants(&cache);
}

#[tokio::test]
async fn retry_budget_exhaustion_surfaces_limit_exceeded() {
    let (streams, cache) = harness(
        StreamsCacheConfig::default()
            .with_backoff_ms(1)
            .with_max_retries(3),
    );
    for _ in 0..3 {
        streams.push_error(MtdbError::LimitExceeded);
    }
    let err = cache
        .get_records(&GetRecordsRequest::new(issue_at(&cache, "0").await))
        .await
        .unwrap_err();
    assert!(matches!(err, MtdbError::LimitExceeded));
    assert_eq!(streams.records_calls(), 3);
}

#[tokio::test]
async fn overlapping_reader_gets_the_suffix_without_a_new_read() {
    let (streams, cache) = harness(StreamsCacheConfig::default());
    streams.push_records(make_records(0, 50), Some("u-next"));

    cache
        .get_records(&GetRecordsRequest::new(issue_at(&cache, "0").await))
        .await
        .expect("reader A");

    let suffix = cache
        .get_records(&GetRecordsRequest::new(issue_at(&cache, "5").await))
        .await
        .expect("reader B");
    assert_eq!(suffix.records.len(), 45);
    assert_eq!(suffix.records[0].sequence_number, "5");
    assert_eq!(streams.records_calls(), 1);
    assert_invariants(&cache);
}

#[tokio::test]
async fn limit_returns_a_prefix_and_a_resumable_iterator() {
    let (streams, cache) = harness(StreamsCacheConfig::default());
    streams.push_records(make_records(0, 50), Some("u-next"));

    let first = cache
        .get_records(&GetRecordsRequest::new(issue_at(&cache, "0").await).with_limit(10))
        .await
        .expect("limited read");
    assert_eq!(first.records.len(), 10);
    assert_eq!(first.records.last().unwrap().sequence_number, "9");

    // the cache kept the full segment; resuming needs no underlying call
    let rest = cache
        .get_records(&GetRecordsRequest::new(
            first.next_shard_iterator.expect("next"),
        ))
        .await
        .expect("resumed read");
    assert_eq!(rest.records.len(), 40);
    assert_eq!(rest.records[0].sequence_number, "10");
    assert_eq!(streams.records_calls(), 1);

    let err = cache
        .get_records(&GetRecordsRequest::new(issue_at(&cache, "0").await).with_limit(0))
        .await
        .unwrap_err();
    assert!(matches!(err, MtdbError::Validation(_)));
    assert_invariants(&cache);
}

#[tokio::test]
async fn empty_results_bypass_the_cache_but_carry_the_iterator_forward() {
    let (streams, cache) = harness(StreamsCacheConfig::default());
    streams.push_records(Vec::new(), Some("u-tail"));

    let empty = cache
        .get_records(&GetRecordsRequest::new(issue_at(&cache, "100").await))
        .await
        .expect("empty read");
    assert!(empty.records.is_empty());
    let next = empty.next_shard_iterator.expect("iterator to proceed with");
    assert!(cache.cached_segments().is_empty(), "empty results are not cached");
    assert_eq!(streams.iterator_calls(), 1);

    // the wrapped underlying iterator is reused on the next call
    streams.push_records(make_records(100, 5), None);
    let follow_up = cache
        .get_records(&GetRecordsRequest::new(next))
        .await
        .expect("follow-up read");
    assert_eq!(follow_up.records.len(), 5);
    assert_eq!(streams.iterator_calls(), 1, "no second iterator acquisition");
    assert_eq!(streams.records_calls(), 2);
    assert_invariants(&cache);
}

#[tokio::test]
async fn trim_horizon_loads_eagerly_and_overlaps_are_trimmed_into_one_segment() {
    let (streams, cache) = harness(StreamsCacheConfig::default());

    streams.push_records(make_records(0, 10), Some("u1"));
    let a = cache
        .get_shard_iterator(&GetShardIteratorRequest::trim_horizon(ARN, SHARD))
        .await
        .expect("iterator A")
        .shard_iterator;
    // logical iterators resolve their underlying iterator eagerly
    assert_eq!(streams.iterator_calls(), 1);
    let a_result = cache
        .get_records(&GetRecordsRequest::new(a))
        .await
        .expect("reader A");
    assert_eq!(a_result.records.len(), 10);

    streams.push_records(make_records(5, 10), Some("u2"));
    let b = cache
        .get_shard_iterator(&GetShardIteratorRequest::trim_horizon(ARN, SHARD))
        .await
        .expect("iterator B")
        .shard_iterator;
    let b_result = cache
        .get_records(&GetRecordsRequest::new(b))
        .await
        .expect("reader B");
    // the overlap [5..9] was already cached; B still sees records from its
    // own position onward
    assert_eq!(b_result.records[0].sequence_number, "5");
    assert_eq!(b_result.records.len(), 10);

    let segments = cache.cached_segments();
    assert_eq!(segments.len(), 1, "segments: {segments:?}");
    assert_eq!(segments[0].first_record_sequence_number, "0");
    assert_eq!(segments[0].last_record_sequence_number, "14");
    assert_invariants(&cache);
}

#[tokio::test]
async fn eviction_is_fifo_by_insertion() {
    let (streams, cache) = harness(StreamsCacheConfig::default().with_max_segments(2));
    streams.push_records(make_records(0, 5), None);
    streams.push_records(make_records(100, 5), None);
    streams.push_records(make_records(200, 5), None);

    for start in ["0", "100", "200"] {
        cache
            .get_records(&GetRecordsRequest::new(issue_at(&cache, start).await))
            .await
            .expect("read");
    }

    let segments = cache.cached_segments();
    assert_eq!(segments.len(), 2);
    let firsts: Vec<&str> = segments
        .iter()
        .map(|s| s.first_record_sequence_number.as_str())
        .collect();
    assert!(!firsts.contains(&"0"), "oldest segment evicted: {firsts:?}");
    assert_invariants(&cache);
}

#[tokio::test]
async fn absolute_reader_on_distinct_shards_do_not_mix() {
    let (streams, cache) = harness(StreamsCacheConfig::default());
    streams.push_records(make_records(0, 5), None);
    streams.push_records(make_records(0, 7), None);

    let a = cache
        .get_shard_iterator(&GetShardIteratorRequest::at_sequence_number(
            ARN, "shard-0001", "0",
        ))
        .await
        .expect("iterator")
        .shard_iterator;
    let b = cache
        .get_shard_iterator(&GetShardIteratorRequest::at_sequence_number(
            ARN, "shard-0002", "0",
        ))
        .await
        .expect("iterator")
        .shard_iterator;

    let a = cache.get_records(&GetRecordsRequest::new(a)).await.expect("a");
    let b = cache.get_records(&GetRecordsRequest::new(b)).await.expect("b");
    assert_eq!(a.records.len(), 5);
    assert_eq!(b.records.len(), 7);
    assert_eq!(streams.records_calls(), 2);
    assert_eq!(cache.cached_segments().len(), 2);
    assert_invariants(&cache);
}
