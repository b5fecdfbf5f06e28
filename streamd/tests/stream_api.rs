//! Integration tests for the stream HTTP surface: create/append/read,
//! producer idempotency, JSON flattening, and reader-key cache bypass.
//! Each test boots the router on an ephemeral port backed by a scratch
//! `DATA_DIR` and drives it with `reqwest`, mirroring the teacher's
//! `tests/http_reads.rs` pattern minus the database dependency this crate
//! doesn't have.

use std::time::Duration;
use streamd::config::Config;

async fn make_server() -> (std::net::SocketAddr, tempfile::TempDir) {
    make_server_with(256 * 1024).await
}

async fn make_server_with(max_read_chunk_bytes: usize) -> (std::net::SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        bind_addr: "127.0.0.1:0".to_owned(),
        data_dir: dir.path().to_path_buf(),
        stream_quota_bytes: 10 * 1024 * 1024,
        max_append_bytes: 1024 * 1024,
        max_read_chunk_bytes,
        long_poll_timeout: Duration::from_millis(500),
        long_poll_stagger: Duration::from_millis(10),
        segment_max_messages: 3,
        segment_max_bytes: 1024 * 1024,
        coalesce_sentinel_ttl: Duration::from_secs(30),
        coalesce_linger: Duration::from_millis(200),
        cursor_bucket: Duration::from_secs(20),
        producer_expiry: Duration::from_secs(7 * 24 * 3600),
        cors_origins: vec![],
    };
    let state = streamd::state::default_state(config);
    let router = streamd::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, dir)
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

#[tokio::test]
async fn put_then_get_round_trips_binary_body() {
    let (addr, _dir) = make_server().await;
    let url = format!("http://{addr}/v1/stream/acme/s1");

    let put = client().put(&url).header("content-type", "text/plain").body("hello").send().await.unwrap();
    assert_eq!(put.status(), reqwest::StatusCode::CREATED);

    let get = client().get(format!("{url}?offset=-1")).send().await.unwrap();
    assert_eq!(get.status(), reqwest::StatusCode::OK);
    let next_offset = get.headers().get("stream-next-offset").unwrap().to_str().unwrap().to_owned();
    let body = get.bytes().await.unwrap();
    assert_eq!(&body[..], b"hello");

    let at_tail = client().get(format!("{url}?offset={next_offset}")).send().await.unwrap();
    assert_eq!(at_tail.status(), reqwest::StatusCode::OK);
    assert_eq!(at_tail.headers().get("stream-up-to-date").map(|v| v.to_str().unwrap()), None);
    assert!(at_tail.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn json_array_bodies_are_flattened_into_individual_messages() {
    let (addr, _dir) = make_server().await;
    let url = format!("http://{addr}/v1/stream/acme/s-json");

    let put = client()
        .put(&url)
        .header("content-type", "application/json")
        .body(r#"[{"a":1},{"a":2}]"#)
        .send()
        .await
        .unwrap();
    assert_eq!(put.status(), reqwest::StatusCode::CREATED);

    let get = client().get(format!("{url}?offset=-1")).send().await.unwrap();
    let body: serde_json::Value = get.json().await.unwrap();
    assert_eq!(body, serde_json::json!([{"a": 1}, {"a": 2}]));
}

#[tokio::test]
async fn duplicate_producer_append_is_acknowledged_without_duplicating_data() {
    let (addr, _dir) = make_server().await;
    let url = format!("http://{addr}/v1/stream/acme/s-producer");

    client().put(&url).header("content-type", "text/plain").body("").send().await.unwrap();

    let post = |body: &'static str| {
        client()
            .post(&url)
            .header("content-type", "text/plain")
            .header("producer-id", "p1")
            .header("producer-epoch", "1")
            .header("producer-seq", "1")
            .body(body)
    };

    let first = post("one").send().await.unwrap();
    assert_eq!(first.status(), reqwest::StatusCode::OK);
    let first_offset = first.headers().get("stream-next-offset").unwrap().to_str().unwrap().to_owned();

    let replay = post("one").send().await.unwrap();
    assert_eq!(replay.status(), reqwest::StatusCode::OK);
    let replay_offset = replay.headers().get("stream-next-offset").unwrap().to_str().unwrap().to_owned();
    assert_eq!(first_offset, replay_offset);

    let get = client().get(format!("{url}?offset=-1")).send().await.unwrap();
    assert_eq!(get.bytes().await.unwrap().as_ref(), b"one");
}

#[tokio::test]
async fn rotation_keeps_historical_data_readable_across_segments() {
    let (addr, _dir) = make_server().await;
    let url = format!("http://{addr}/v1/stream/acme/s-rotate");

    client().put(&url).header("content-type", "text/plain").body("m0").send().await.unwrap();
    for i in 1..6 {
        client().post(&url).header("content-type", "text/plain").body(format!("m{i}")).send().await.unwrap();
    }
    // segment_max_messages=3, so at least one rotation should have happened by
    // now. A single read only covers one segment/chunk at a time, so follow
    // `stream-next-offset` until the response reports `up-to-date`.
    let mut offset = "-1".to_owned();
    let mut assembled = Vec::new();
    loop {
        let resp = client().get(format!("{url}?offset={offset}")).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let up_to_date: bool = resp.headers().get("stream-up-to-date").map(|v| v.to_str().unwrap() == "true").unwrap_or(false);
        offset = resp.headers().get("stream-next-offset").unwrap().to_str().unwrap().to_owned();
        assembled.extend_from_slice(&resp.bytes().await.unwrap());
        if up_to_date {
            break;
        }
    }
    assert_eq!(&assembled[..], b"m0m1m2m3m4m5");
}

#[tokio::test]
async fn unknown_offset_read_seq_is_rejected() {
    let (addr, _dir) = make_server().await;
    let url = format!("http://{addr}/v1/stream/acme/s-bad-offset");
    client().put(&url).header("content-type", "text/plain").body("hi").send().await.unwrap();

    let bad = client().get(format!("{url}?offset=9999999999999999_0000000000000000")).send().await.unwrap();
    assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn a_partial_not_up_to_date_read_is_cached_and_served_as_a_cache_hit() {
    // A small chunk cap forces the first read to stop short of the tail,
    // which is the only plain-GET case the cacheability rule (spec §4.8)
    // allows: it's immutable once returned, unlike an at-tail response that
    // would go stale the instant another append lands.
    let (addr, _dir) = make_server_with(2).await;
    let url = format!("http://{addr}/v1/stream/acme/s-cache");
    client().put(&url).header("content-type", "text/plain").body("m0").send().await.unwrap();
    client().post(&url).header("content-type", "text/plain").body("m1").send().await.unwrap();

    let first = client().get(format!("{url}?offset=-1")).send().await.unwrap();
    assert_eq!(first.headers().get("x-cache").unwrap(), "MISS");
    assert_eq!(first.headers().get("stream-up-to-date").unwrap(), "false");

    let second = client().get(format!("{url}?offset=-1")).send().await.unwrap();
    assert_eq!(second.headers().get("x-cache").unwrap(), "HIT");
}

#[tokio::test]
async fn long_poll_wakes_up_on_append_and_returns_new_data() {
    let (addr, _dir) = make_server().await;
    let url = format!("http://{addr}/v1/stream/acme/s-longpoll");
    client().put(&url).header("content-type", "text/plain").body("m0").send().await.unwrap();

    let waiter_url = format!("{url}?offset=now&live=long-poll");
    let waiter = tokio::spawn(async move { client().get(waiter_url).send().await.unwrap() });

    tokio::time::sleep(Duration::from_millis(100)).await;
    client().post(&url).header("content-type", "text/plain").body("m1").send().await.unwrap();

    let response = waiter.await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"m1");
}

#[tokio::test]
async fn head_reports_closed_state_after_close() {
    let (addr, _dir) = make_server().await;
    let url = format!("http://{addr}/v1/stream/acme/s-close");
    client().put(&url).header("content-type", "text/plain").body("m0").send().await.unwrap();
    client().post(&url).header("stream-closed", "true").send().await.unwrap();

    let head = client().head(&url).send().await.unwrap();
    assert_eq!(head.status(), reqwest::StatusCode::OK);
    assert_eq!(head.headers().get("stream-closed").unwrap(), "true");

    let append_after_close =
        client().post(&url).header("content-type", "text/plain").body("late").send().await.unwrap();
    assert_eq!(append_after_close.status(), reqwest::StatusCode::CONFLICT);
}

#[tokio::test]
async fn delete_removes_the_stream_so_subsequent_reads_404() {
    let (addr, _dir) = make_server().await;
    let url = format!("http://{addr}/v1/stream/acme/s-delete");
    client().put(&url).header("content-type", "text/plain").body("m0").send().await.unwrap();

    let delete = client().delete(&url).send().await.unwrap();
    assert_eq!(delete.status(), reqwest::StatusCode::NO_CONTENT);

    let get = client().get(format!("{url}?offset=-1")).send().await.unwrap();
    assert_eq!(get.status(), reqwest::StatusCode::NOT_FOUND);
}
