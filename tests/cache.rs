//! Cache-level behaviour: the TTL store over the engine.

mod common;

use chrono::{Duration, TimeZone, Utc};
use tempfile::TempDir;

use blobfile::{
    BlobCache, CacheOptions, CancelToken, ChunkType, Error, KeyComparer, StorageOptions,
};

fn far_future() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap()
}

fn open_cache(dir: &TempDir, options: CacheOptions) -> BlobCache {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut cache = BlobCache::with_options(
        dir.path().join("cache.blob"),
        options,
        StorageOptions::default(),
    );
    assert!(cache.initialize(&CancelToken::new()).unwrap());
    cache
}

/// Deterministic bytes that deflate cannot shrink.
fn noise(len: usize) -> Vec<u8> {
    let mut state = 0x2545_F491_4F6C_DD1Du64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 32) as u8
        })
        .collect()
}

#[test]
fn add_then_get_roundtrip() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir, CacheOptions::default());
    let cancel = CancelToken::new();

    let payload = noise(100 * 1024);
    cache.add("xunit.core.xml", far_future(), &payload, &cancel).unwrap();

    assert!(cache.exists("xunit.core.xml", &cancel).unwrap());
    assert_eq!(cache.get("xunit.core.xml", &cancel).unwrap().unwrap(), payload);
    common::assert_invariants(cache.storage().path());
}

#[test]
fn compressible_values_roundtrip_and_shrink_the_file() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir, CacheOptions::default());
    let cancel = CancelToken::new();

    let payload = vec![0x42u8; 256 * 1024];
    cache.add("zeros", far_future(), &payload, &cancel).unwrap();

    assert_eq!(cache.get("zeros", &cancel).unwrap().unwrap(), payload);
    let file_size = std::fs::metadata(cache.storage().path()).unwrap().len();
    assert!(
        file_size < payload.len() as u64 / 4,
        "{file_size} bytes on disk for a {}-byte value",
        payload.len()
    );
}

#[test]
fn values_larger_than_one_chunk_are_fragmented() {
    let dir = TempDir::new().unwrap();
    let options = CacheOptions { can_compress: false, ..Default::default() };
    let cache = open_cache(&dir, options);
    let cancel = CancelToken::new();

    // Three fragments: 5 MiB, 5 MiB, 1 MiB.
    let payload = noise(11 * 1024 * 1024);
    cache.add("big", far_future(), &payload, &cancel).unwrap();

    let snapshot = cache.storage().snapshot(&cancel).unwrap();
    let data_chunks =
        snapshot.chunks().iter().filter(|c| c.chunk_type == ChunkType::DATA).count();
    assert_eq!(data_chunks, 3);

    assert_eq!(cache.get("big", &cancel).unwrap().unwrap(), payload);
    common::assert_invariants(cache.storage().path());
}

#[test]
fn expired_entries_read_as_missing() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir, CacheOptions::default());
    let cancel = CancelToken::new();

    let expired = Utc::now() - Duration::seconds(5);
    cache.add("stale", expired, b"old bytes", &cancel).unwrap();

    assert!(!cache.exists("stale", &cancel).unwrap());
    assert!(cache.get("stale", &cancel).unwrap().is_none());
}

#[test]
fn overwrite_replaces_and_reclaims() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir, CacheOptions::default());
    let cancel = CancelToken::new();

    let a = vec![0xAAu8; 100 * 1024];
    let b = vec![0xBBu8; 100 * 1024];
    cache.add("k", far_future(), &a, &cancel).unwrap();
    cache.add("k", far_future(), &b, &cancel).unwrap();

    assert_eq!(cache.get("k", &cancel).unwrap().unwrap(), b);
    let file_size = std::fs::metadata(cache.storage().path()).unwrap().len();
    assert!(
        file_size <= (a.len() + b.len()) as u64,
        "{file_size} bytes on disk after overwrite"
    );
    common::assert_invariants(cache.storage().path());
}

#[test]
fn remove_reports_whether_anything_went() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir, CacheOptions::default());
    let cancel = CancelToken::new();

    cache.add("gone", far_future(), b"payload", &cancel).unwrap();
    assert!(cache.remove("gone", &cancel).unwrap());
    assert!(!cache.remove("gone", &cancel).unwrap());
    assert!(cache.get("gone", &cancel).unwrap().is_none());

    // Everything the entry owned is free space now.
    let snapshot = cache.storage().snapshot(&cancel).unwrap();
    assert!(snapshot.is_empty());
}

#[test]
fn empty_values_are_legal() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir, CacheOptions::default());
    let cancel = CancelToken::new();

    cache.add("empty", far_future(), b"", &cancel).unwrap();
    assert!(cache.exists("empty", &cancel).unwrap());
    assert_eq!(cache.get("empty", &cancel).unwrap().unwrap(), Vec::<u8>::new());
}

#[test]
fn empty_keys_are_rejected() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir, CacheOptions::default());
    let cancel = CancelToken::new();

    assert!(matches!(
        cache.add("", far_future(), b"x", &cancel),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(cache.get("", &cancel), Err(Error::InvalidArgument(_))));
    assert!(matches!(cache.exists("", &cancel), Err(Error::InvalidArgument(_))));
    assert!(matches!(cache.remove("", &cancel), Err(Error::InvalidArgument(_))));
}

#[test]
fn case_insensitive_keys_fold_together() {
    let dir = TempDir::new().unwrap();
    let options = CacheOptions { key_comparer: KeyComparer::CaseInsensitive, ..Default::default() };
    let cache = open_cache(&dir, options);
    let cancel = CancelToken::new();

    cache.add("Mixed.Case", far_future(), b"folded", &cancel).unwrap();
    assert!(cache.exists("mixed.case", &cancel).unwrap());
    assert_eq!(cache.get("MIXED.CASE", &cancel).unwrap().unwrap(), b"folded");
    assert!(cache.remove("mixed.CASE", &cancel).unwrap());
    assert!(!cache.exists("Mixed.Case", &cancel).unwrap());
}

#[test]
fn case_sensitive_keys_stay_distinct() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir, CacheOptions::default());
    let cancel = CancelToken::new();

    cache.add("Key", far_future(), b"upper", &cancel).unwrap();
    assert!(!cache.exists("key", &cancel).unwrap());
}

#[test]
fn cleanup_drops_expired_entries_and_shrinks_the_file() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir, CacheOptions::default());
    let cancel = CancelToken::new();

    cache.add("keep", far_future(), &noise(4096), &cancel).unwrap();
    cache.add("drop", Utc::now() + Duration::minutes(2), &noise(4096), &cancel).unwrap();
    let size_before = std::fs::metadata(cache.storage().path()).unwrap().len();

    cache.cleanup(Utc::now() + Duration::days(2), &cancel).unwrap();

    let snapshot = cache.storage().snapshot(&cancel).unwrap();
    let heads = snapshot.chunks().iter().filter(|c| c.chunk_type == ChunkType::HEAD).count();
    let datas = snapshot.chunks().iter().filter(|c| c.chunk_type == ChunkType::DATA).count();
    assert_eq!(heads, 1);
    assert_eq!(datas, 1);
    assert!(cache.exists("keep", &cancel).unwrap());

    let size_after = std::fs::metadata(cache.storage().path()).unwrap().len();
    assert!(size_after < size_before);
    common::assert_invariants(cache.storage().path());
}

#[test]
fn cleanup_reaps_day_old_orphan_data_chunks() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir, CacheOptions::default());
    let cancel = CancelToken::new();

    cache.add("entry", far_future(), &noise(2048), &cancel).unwrap();
    // A data chunk no head references, as a crashed add would leave it.
    cache
        .storage()
        .add_chunk(ChunkType::DATA, 0xDEAD, &noise(512), &cancel)
        .unwrap();

    // Young orphans survive (an add may be in flight)...
    cache.cleanup(Utc::now(), &cancel).unwrap();
    let snapshot = cache.storage().snapshot(&cancel).unwrap();
    assert_eq!(
        snapshot.chunks().iter().filter(|c| c.chunk_type == ChunkType::DATA).count(),
        2
    );

    // ...but not once they are older than a day.
    cache.cleanup(Utc::now() + Duration::days(2), &cancel).unwrap();
    let snapshot = cache.storage().snapshot(&cancel).unwrap();
    let orphans: Vec<_> = snapshot
        .chunks()
        .iter()
        .filter(|c| c.chunk_type == ChunkType::DATA && c.user_data == 0xDEAD)
        .collect();
    assert!(orphans.is_empty());
    assert!(cache.exists("entry", &cancel).unwrap());
}

#[test]
fn size_cap_evicts_shortest_ttl_first() {
    let dir = TempDir::new().unwrap();
    let options = CacheOptions {
        maximum_size: 4096,
        cutback_ratio: 0.8,
        can_compress: false,
        cleanup_at_initialize: false,
        ..Default::default()
    };
    let cache = open_cache(&dir, options);
    let cancel = CancelToken::new();
    let now = Utc::now();

    // The survivor goes in first so the evicted entries sit at the tail
    // and the freed space can be truncated.
    cache.add("survivor", now + Duration::hours(9), &noise(2000), &cancel).unwrap();
    cache.add("doomed-a", now + Duration::hours(1), &noise(2000), &cancel).unwrap();
    cache.add("doomed-b", now + Duration::hours(2), &noise(2000), &cancel).unwrap();
    assert!(std::fs::metadata(cache.storage().path()).unwrap().len() >= 4096);

    cache.cleanup(now, &cancel).unwrap();

    assert!(cache.exists("survivor", &cancel).unwrap());
    assert!(!cache.exists("doomed-a", &cancel).unwrap());
    let file_size = std::fs::metadata(cache.storage().path()).unwrap().len();
    assert!(file_size <= 4096, "{file_size} bytes after eviction");
    common::assert_invariants(cache.storage().path());
}

#[test]
fn initialize_returns_false_for_foreign_files() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.blob");
    std::fs::write(&path, b"this is not a blob file at all").unwrap();

    let mut cache = BlobCache::new(&path);
    assert!(!cache.initialize(&CancelToken::new()).unwrap());
}

#[test]
fn initialize_can_replace_an_invalid_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.blob");
    std::fs::write(&path, b"this is not a blob file at all").unwrap();

    let options = CacheOptions { remove_invalid_cache: true, ..Default::default() };
    let mut cache = BlobCache::with_options(&path, options, StorageOptions::default());
    let cancel = CancelToken::new();
    assert!(cache.initialize(&cancel).unwrap());

    cache.add("fresh", far_future(), b"usable again", &cancel).unwrap();
    assert_eq!(cache.get("fresh", &cancel).unwrap().unwrap(), b"usable again");
}

#[test]
fn initialize_deletes_files_grown_past_twice_the_cap() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.blob");
    std::fs::write(&path, vec![0u8; 5000]).unwrap();

    let options = CacheOptions { maximum_size: 2048, ..Default::default() };
    let mut cache = BlobCache::with_options(&path, options, StorageOptions::default());
    assert!(cache.initialize(&CancelToken::new()).unwrap());
    assert!(std::fs::metadata(&path).unwrap().len() < 5000);
}

#[test]
fn entries_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.blob");
    let cancel = CancelToken::new();
    let payload = noise(64 * 1024);

    {
        let cache = open_cache(&dir, CacheOptions::default());
        cache.add("persisted", far_future(), &payload, &cancel).unwrap();
    }

    let mut cache = BlobCache::new(&path);
    assert!(cache.initialize(&cancel).unwrap());
    assert_eq!(cache.get("persisted", &cancel).unwrap().unwrap(), payload);
}

#[test]
fn get_into_streams_to_any_sink() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir, CacheOptions::default());
    let cancel = CancelToken::new();

    let payload = noise(8192);
    cache.add("streamed", far_future(), &payload, &cancel).unwrap();

    let mut sink = Vec::new();
    assert!(cache.get_into("streamed", &mut sink, &cancel).unwrap());
    assert_eq!(sink, payload);

    let mut sink = Vec::new();
    assert!(!cache.get_into("absent", &mut sink, &cancel).unwrap());
    assert!(sink.is_empty());
}
