//! Integration tests for pooled connections carrying chunked responses.
//!
//! These tests drive the pool and the chunk decoder together the way an
//! HTTP/1.1 client does: check out a connection, decode a body from it, and
//! return it for reuse only when the body ended cleanly.

use std::io::{self, Cursor, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tether::prelude::*;
use tether::tether_chunked::{DecodeState, encode_chunked};

/// An in-memory connection whose server side already wrote its responses.
struct MemoryConn {
    wire: Cursor<Vec<u8>>,
    disposed: Arc<AtomicUsize>,
}

impl PooledStream for MemoryConn {
    fn dispose(&mut self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

fn pipelined_wire() -> Vec<u8> {
    let mut wire = encode_chunked(b"first response body", &[6]).to_vec();
    wire.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
    wire
}

fn memory_pool(
    timers: &TimerService,
    wire: fn() -> Vec<u8>,
) -> (ConnectionPool<MemoryConn>, Arc<AtomicUsize>) {
    let disposed = Arc::new(AtomicUsize::new(0));
    let factory_disposed = Arc::clone(&disposed);
    let pool = ConnectionPool::new(
        Endpoint::new("origin.test", 80),
        PoolConfig::new(2),
        timers,
        move |_: &Endpoint| -> io::Result<MemoryConn> {
            Ok(MemoryConn {
                wire: Cursor::new(wire()),
                disposed: Arc::clone(&factory_disposed),
            })
        },
    )
    .unwrap();
    (pool, disposed)
}

// =============================================================================
// Blocking workflows
// =============================================================================

#[test]
fn test_clean_body_returns_connection() {
    let timers = TimerService::new();
    let (pool, disposed) = memory_pool(&timers, pipelined_wire);

    let mut lease = pool.get_connection(1_000).unwrap();
    let (body, leftover, done) = {
        let mut decoder = ChunkedDecoder::new(&mut lease.wire);
        let mut body = Vec::new();
        decoder.read_to_end(&mut body).unwrap();
        let leftover = decoder.try_get_leftover_bytes().map(<[u8]>::to_vec);
        (body, leftover, decoder.is_done())
    };

    assert_eq!(body, b"first response body");
    assert_eq!(leftover.as_deref(), Some(&b"HTTP/1.1 200 OK\r\n"[..]));
    pool.put_connection(lease, done).unwrap();

    assert_eq!(pool.idle_count(), 1);
    assert_eq!(disposed.load(Ordering::SeqCst), 0);
}

#[test]
fn test_broken_body_discards_connection() {
    let timers = TimerService::new();
    let (pool, disposed) = memory_pool(&timers, || b"5\r\nhelloXX".to_vec());

    let mut lease = pool.get_connection(1_000).unwrap();
    let (err, state) = {
        let mut decoder = ChunkedDecoder::new(&mut lease.wire);
        let err = decoder.read_to_end(&mut Vec::new()).unwrap_err();
        (err, decoder.state())
    };

    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    assert_eq!(state, DecodeState::Error);
    pool.put_connection(lease, false).unwrap();

    assert_eq!(pool.count(), 0);
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_lookahead_from_head_read() {
    let timers = TimerService::new();
    let (pool, _) = memory_pool(&timers, || {
        let mut wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        wire.extend_from_slice(&encode_chunked(b"payload after head", &[4]));
        wire
    });

    let mut lease = pool.get_connection(1_000).unwrap();

    // Read the head plus whatever followed it in the same read.
    let mut head = vec![0u8; 4096];
    let n = lease.wire.read(&mut head).unwrap();
    let head_end = head[..n]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
        .unwrap();

    let mut decoder = ChunkedDecoder::with_buffer(
        &mut lease.wire,
        head,
        head_end,
        n - head_end,
        DecoderConfig::default(),
    );
    let mut body = String::new();
    decoder.read_to_string(&mut body).unwrap();
    assert_eq!(body, "payload after head");
    assert_eq!(decoder.try_get_leftover_bytes(), Some(&b""[..]));
    drop(decoder);

    pool.put_connection(lease, true).unwrap();
}

// =============================================================================
// Async workflows
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_checkout_and_decode() {
    use tokio::io::AsyncReadExt;

    let timers = TimerService::new();
    let (pool, _) = memory_pool(&timers, pipelined_wire);

    let mut lease = pool.acquire(1_000).await.unwrap();
    let mut decoder = ChunkedDecoder::new(&mut lease.wire);
    let mut body = Vec::new();
    AsyncReadExt::read_to_end(&mut decoder, &mut body)
        .await
        .unwrap();
    let done = decoder.is_done();
    drop(decoder);

    assert_eq!(body, b"first response body");
    pool.put_connection(lease, done).unwrap();
    assert_eq!(pool.idle_count(), 1);

    let again = pool.acquire(1_000).await.unwrap();
    assert!(!again.is_fresh());
}

#[test]
fn test_shutdown_disposes_idle_connections() {
    let timers = TimerService::new();
    let (pool, disposed) = memory_pool(&timers, pipelined_wire);
    let a = pool.get_connection(1_000).unwrap();
    let b = pool.get_connection(1_000).unwrap();
    pool.put_connection(a, true).unwrap();

    pool.shutdown();
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
    pool.put_connection(b, true).unwrap();
    assert_eq!(disposed.load(Ordering::SeqCst), 2);
    assert_eq!(pool.count(), 0);
    assert!(pool.get_connection(INFINITE).is_err());
}
