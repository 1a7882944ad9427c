use std::time::Duration;

use trawl_client::ReqwestTransport;
use trawl_core::error::AppError;
use trawl_core::models::ApiRequest;
use trawl_core::traits::Transport;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::transport;

#[tokio::test]
async fn sends_params_and_headers() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/items"))
        .and(query_param("page", "2"))
        .and(header("x-api-key", "secret"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-RateLimit-Remaining", "7")
                .set_body_string(r#"{"items":[]}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let request = ApiRequest::get("/items")
        .with_param("page", "2")
        .with_header("x-api-key", "secret");
    let response = transport(&server).request(&request).await?;

    assert_eq!(response.status, 200);
    assert_eq!(response.header("x-ratelimit-remaining"), Some("7"));
    assert_eq!(response.body_text(), r#"{"items":[]}"#);
    Ok(())
}

#[tokio::test]
async fn error_statuses_are_returned_not_raised() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(path("/v1/busy"))
        .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "3"))
        .mount(&server)
        .await;

    let response = transport(&server).request(&ApiRequest::get("/busy")).await?;
    assert_eq!(response.status, 503);
    assert_eq!(response.retry_after(), Some(Duration::from_secs(3)));
    Ok(())
}

#[tokio::test]
async fn absolute_locator_ignores_base() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(path("/files/a.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
        .mount(&server)
        .await;

    let locator = format!("{}/files/a.bin", server.uri());
    let response = transport(&server).request(&ApiRequest::get(locator)).await?;
    assert_eq!(response.body, vec![1, 2, 3]);
    Ok(())
}

#[tokio::test]
async fn slow_reply_is_a_timeout() {
    let server = MockServer::start().await;
    Mock::given(path("/v1/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(800)))
        .mount(&server)
        .await;

    let transport = ReqwestTransport::with_timeout(Duration::from_millis(100))
        .unwrap()
        .with_base_url(&format!("{}/v1", server.uri()))
        .unwrap()
        .allow_private_urls();

    let err = transport
        .request(&ApiRequest::get("/slow"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Timeout(_)), "{err:?}");
}

#[tokio::test]
async fn refused_connection_is_a_network_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let transport = ReqwestTransport::new().unwrap().allow_private_urls();
    let err = transport
        .request(&ApiRequest::get(format!("http://127.0.0.1:{port}/x")))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NetworkError(_)), "{err:?}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn private_hosts_are_blocked_by_default() {
    let server = MockServer::start().await;
    let transport = ReqwestTransport::new()
        .unwrap()
        .with_base_url(&server.uri())
        .unwrap();

    let err = transport
        .request(&ApiRequest::get("/anything"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PermanentFailure { .. }));
    assert!(err.to_string().contains("SSRF blocked"));
}
