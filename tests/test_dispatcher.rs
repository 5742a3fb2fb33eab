//! Routing through the dispatcher and the front server

use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_RANGE, RANGE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use http_body_util::BodyExt;
use reqwest::Url;
use std::sync::Arc;
use tile_proxy::config::ApiEndpointConfig;
use tile_proxy::{
    InboundRequest, MemoryCacheStorage, MemoryTileStore, PassReason, ProxyDispatcher,
    ProxyMetrics, ProxyServer, Route, TileProxyConfig, TileStore, VersionedCacheStore,
};
use tokio::net::TcpListener;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn build(config: &TileProxyConfig) -> Arc<ProxyDispatcher> {
    let cache = Arc::new(VersionedCacheStore::new(
        Arc::new(MemoryCacheStorage::new()),
        config.cache_version_name(),
    ));
    let store: Arc<dyn TileStore> = Arc::new(MemoryTileStore::new());
    let metrics = Arc::new(ProxyMetrics::new().unwrap());
    Arc::new(ProxyDispatcher::new(config, cache, Some(store), metrics).unwrap())
}

fn config_for(server: &MockServer) -> TileProxyConfig {
    TileProxyConfig {
        origin: server.uri(),
        backend: server.uri(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_post_is_forwarded_with_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/submit"))
        .and(body_string("payload"))
        .respond_with(ResponseTemplate::new(201).set_body_string("created"))
        .expect(1)
        .mount(&server)
        .await;
    let dispatcher = build(&config_for(&server));

    let url = Url::parse(&format!("{}/api/submit", server.uri())).unwrap();
    let request = InboundRequest::new(Method::POST, url).with_body("payload");
    assert_eq!(dispatcher.classify(&request), Route::Passthrough(PassReason::NonGet));

    let response = dispatcher.handle(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, Bytes::from_static(b"created"));
    assert_eq!(dispatcher.metrics().requests("passthrough"), 1);
}

#[tokio::test]
async fn test_dispatch_future_is_send() {
    fn assert_send<T: Send>(_: &T) {}

    let server = MockServer::start().await;
    let dispatcher = build(&config_for(&server));
    let url = Url::parse(&format!("{}/api/submit", server.uri())).unwrap();
    let handling = dispatcher.handle(InboundRequest::new(Method::POST, url));
    assert_send(&handling);
}

#[tokio::test]
async fn test_cross_origin_is_forwarded_verbatim() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/lib.js"))
        .respond_with(ResponseTemplate::new(200).set_body_string("lib"))
        .expect(1)
        .mount(&server)
        .await;

    // The engine's origin names another host, so the mock server is foreign
    let config = TileProxyConfig {
        origin: "https://app.example.com".to_string(),
        ..Default::default()
    };
    let dispatcher = build(&config);

    let url = Url::parse(&format!("{}/lib.js", server.uri())).unwrap();
    let request = InboundRequest::new(Method::GET, url);
    assert_eq!(
        dispatcher.classify(&request),
        Route::Passthrough(PassReason::CrossOrigin)
    );

    let response = dispatcher.handle(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, Bytes::from_static(b"lib"));
}

#[tokio::test]
async fn test_same_origin_range_is_relayed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/video.mp4"))
        .and(header("range", "bytes=100-199"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-range", "bytes 100-199/5000")
                .set_body_bytes(vec![7u8; 100]),
        )
        .expect(1)
        .mount(&server)
        .await;
    let dispatcher = build(&config_for(&server));

    let url = Url::parse(&format!("{}/video.mp4", server.uri())).unwrap();
    let mut headers = HeaderMap::new();
    headers.insert(RANGE, HeaderValue::from_static("bytes=100-199"));
    let request = InboundRequest::new(Method::GET, url).with_headers(headers);
    assert_eq!(dispatcher.classify(&request), Route::RangePassthrough);

    let response = dispatcher.handle(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[CONTENT_RANGE], "bytes 100-199/5000");
    assert_eq!(dispatcher.metrics().requests("range_passthrough"), 1);
}

#[tokio::test]
async fn test_upstream_failure_after_retries() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-length", "1000000")
                .set_body_bytes(vec![0u8; 1_000_000]),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let mut config = config_for(&server);
    config.max_retries = 1;
    config.upstream.api = Some(ApiEndpointConfig {
        url_template: format!("{}/files/{{id}}", server.uri()),
        access_key: None,
        auth_header: None,
    });
    let dispatcher = build(&config);

    let url = Url::parse(&format!("{}/largefile/flaky", server.uri())).unwrap();
    let mut headers = HeaderMap::new();
    headers.insert(RANGE, HeaderValue::from_static("bytes=0-"));
    let request = InboundRequest::new(Method::GET, url).with_headers(headers);

    let error = dispatcher.handle(request).await.unwrap_err();
    assert!(error.should_retry());
    assert_eq!(error.to_http_status(), 502);
    assert_eq!(dispatcher.metrics().upstream_fetches(false), 1);
    assert_eq!(dispatcher.metrics().requests("large_object"), 1);
}

#[tokio::test]
async fn test_server_end_to_end() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string("<html>home</html>"),
        )
        .mount(&backend)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/files/movie"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&backend)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/movie"))
        .and(header("range", "bytes=0-0"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-range", "bytes 0-0/300000")
                .set_body_bytes(vec![0u8]),
        )
        .mount(&backend)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/movie"))
        .and(header("range", "bytes=65536-131071"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-range", "bytes 65536-131071/300000")
                .set_body_bytes(vec![9u8; 65536]),
        )
        .expect(1)
        .mount(&backend)
        .await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut config = TileProxyConfig {
        origin: format!("http://{}", addr),
        backend: backend.uri(),
        tile_size: 65536,
        ..Default::default()
    };
    config.upstream.api = Some(ApiEndpointConfig {
        url_template: format!("{}/files/{{id}}", backend.uri()),
        access_key: None,
        auth_header: None,
    });
    let dispatcher = build(&config);
    tokio::spawn(
        ProxyServer::new(dispatcher.clone())
            .with_default_scheme("http")
            .serve(listener),
    );

    let client = reqwest::Client::new();

    let page = client
        .get(format!("http://{}/", addr))
        .header(ACCEPT, "text/html")
        .send()
        .await
        .unwrap();
    assert_eq!(page.status(), StatusCode::OK);
    assert_eq!(page.text().await.unwrap(), "<html>home</html>");

    let tile = client
        .get(format!("http://{}/largefile/movie", addr))
        .header(RANGE, "bytes=70000-")
        .send()
        .await
        .unwrap();
    assert_eq!(tile.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        tile.headers()[CONTENT_RANGE].to_str().unwrap(),
        "bytes 70000-131071/300000"
    );
    assert_eq!(tile.bytes().await.unwrap().len(), 131071 - 70000 + 1);

    assert_eq!(dispatcher.metrics().requests("navigation"), 1);
    assert_eq!(dispatcher.metrics().requests("large_object"), 1);
}
