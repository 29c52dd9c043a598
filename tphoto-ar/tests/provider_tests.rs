//! Cache-first provider: single flight per key, corruption recovery and
//! cancellation

mod helpers;

use helpers::{provider, request, wait_until, FakeBackend, Outcome};
use std::time::Duration;
use tempfile::TempDir;
use tphoto_ar::error::Error;
use tphoto_ar::fetch::{FetchStage, VideoOrigin, VideoSource};

#[tokio::test]
async fn test_concurrent_requests_share_one_fetch() {
    let backend = FakeBackend::start().await;
    backend.state.set_generate_delay(Duration::from_millis(100));
    let dir = TempDir::new().unwrap();
    let (provider, _cache) = provider(&backend, &dir).await;

    let req = request("P1", "Hello", "V1");
    let (a, b, c) = tokio::join!(
        provider.get(req.clone()),
        provider.get(req.clone()),
        provider.get(req.clone())
    );

    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
    assert_eq!(backend.state.generate_calls(), 1);
    assert_eq!(backend.state.download_calls(), 1);
    assert_eq!(a.key, req.cache_key());
    assert_eq!(a.path(), b.path());
    assert_eq!(b.path(), c.path());
    assert_eq!(a.origin, VideoOrigin::Backend);
    assert_eq!(provider.inflight_count(), 0);
}

#[tokio::test]
async fn test_second_request_served_from_cache() {
    let backend = FakeBackend::start().await;
    let dir = TempDir::new().unwrap();
    let (provider, cache) = provider(&backend, &dir).await;

    let req = request("P1", "Hello", "V1");
    let first = provider.get(req.clone()).await.unwrap();
    assert_eq!(first.origin, VideoOrigin::Backend);
    drop(first);

    let second = provider.get(req).await.unwrap();
    assert_eq!(second.origin, VideoOrigin::Cache);
    assert_eq!(second.meta.lip.width(), 0.2);
    assert_eq!(second.meta.duration_ms, Some(10_000));
    assert_eq!(backend.state.generate_calls(), 1);

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.entries, 1);
    // The post-write checkout counts as a hit too
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn test_distinct_requests_fetch_separately() {
    let backend = FakeBackend::start().await;
    let dir = TempDir::new().unwrap();
    let (provider, cache) = provider(&backend, &dir).await;

    let (a, b) = tokio::join!(
        provider.get(request("P1", "Hello", "V1")),
        provider.get(request("P1", "Hello", "V2"))
    );
    assert_ne!(a.unwrap().key, b.unwrap().key);
    assert_eq!(backend.state.generate_calls(), 2);
    assert_eq!(cache.stats().await.unwrap().entries, 2);
}

#[tokio::test]
async fn test_corrupted_cache_entry_refetched() {
    let backend = FakeBackend::start().await;
    let dir = TempDir::new().unwrap();
    let (provider, cache) = provider(&backend, &dir).await;

    let req = request("P1", "Hello", "V1");
    let path = provider.get(req.clone()).await.unwrap().path().to_path_buf();
    tokio::fs::write(&path, b"flipped bits").await.unwrap();

    let again = provider.get(req).await.unwrap();
    assert_eq!(again.origin, VideoOrigin::Backend);
    assert_eq!(backend.state.generate_calls(), 2);

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.corruptions, 1);
    assert_eq!(stats.entries, 1);
}

#[tokio::test]
async fn test_failure_shared_by_all_waiters() {
    let backend = FakeBackend::start().await;
    backend.state.set_generate_delay(Duration::from_millis(50));
    backend.state.set_outcome(Outcome::Fail("no face found".into()));
    let dir = TempDir::new().unwrap();
    let (provider, cache) = provider(&backend, &dir).await;

    let req = request("P1", "Hello", "V1");
    let (a, b) = tokio::join!(provider.get(req.clone()), provider.get(req));

    for result in [a, b] {
        let err = result.unwrap_err();
        assert!(matches!(&*err, Error::GenerationFailed(m) if m == "no face found"));
    }
    assert_eq!(backend.state.generate_calls(), 1);
    assert_eq!(cache.stats().await.unwrap().entries, 0);
}

#[tokio::test]
async fn test_progress_reports_stages() {
    let backend = FakeBackend::start().await;
    let dir = TempDir::new().unwrap();
    let (provider, _cache) = provider(&backend, &dir).await;

    let ticket = provider.fetch(request("P1", "Hello", "V1"));
    let progress = ticket.progress();
    assert_eq!(*progress.borrow(), FetchStage::Checking);

    ticket.wait().await.unwrap();
    assert_eq!(*progress.borrow(), FetchStage::Downloading);
}

#[tokio::test]
async fn test_dropping_last_ticket_cancels_flight() {
    let backend = FakeBackend::start().await;
    backend.state.set_generate_delay(Duration::from_millis(200));
    let dir = TempDir::new().unwrap();
    let (provider, cache) = provider(&backend, &dir).await;

    let req = request("P1", "Hello", "V1");
    let ticket = provider.fetch(req.clone());
    let waiter = tokio::spawn(ticket.wait());

    let state = backend.state.clone();
    wait_until(|| state.generate_calls() == 1).await;
    assert_eq!(provider.inflight_count(), 1);

    waiter.abort();
    assert!(waiter.await.unwrap_err().is_cancelled());
    assert_eq!(provider.inflight_count(), 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(backend.state.download_calls(), 0);
    assert!(cache.get(&req.cache_key()).await.unwrap().is_none());

    // A later request starts a fresh flight
    provider.get(req).await.unwrap();
    assert_eq!(backend.state.generate_calls(), 2);
}
