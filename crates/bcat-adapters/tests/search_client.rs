use std::time::Duration;

use bcat_adapters::{
    ApiCredential, BookSearchClient, CredentialRotator, FetchError, PageRequest, SearchClientConfig,
    SearchSource,
};
use bcat_core::SortOrder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Serve exactly one HTTP response and hand back the raw request head.
async fn one_shot_server(status_line: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut chunk).await.expect("read");
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let response = format!(
            "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.expect("write");
        socket.shutdown().await.ok();
        String::from_utf8_lossy(&buf).to_string()
    });
    (format!("http://{addr}/v1/search/book.json"), handle)
}

fn client(endpoint: String) -> BookSearchClient {
    let credentials = CredentialRotator::new(vec![ApiCredential {
        client_id: "test-id".into(),
        client_secret: "test-secret".into(),
    }])
    .expect("pool");
    BookSearchClient::new(
        SearchClientConfig {
            endpoint,
            timeout: Duration::from_secs(5),
            user_agent: Some("bcat-test/0.1".into()),
        },
        credentials,
    )
    .expect("client")
}

fn request() -> PageRequest {
    PageRequest {
        term: "Statistics".into(),
        sort: SortOrder::Relevance,
        start: 101,
        display: 100,
    }
}

#[tokio::test]
async fn fetch_page_sends_credentials_and_paging_parameters() {
    let (endpoint, server) = one_shot_server(
        "HTTP/1.1 200 OK",
        r#"{"total": 1, "items": [{"title": "Practical Statistics", "isbn": "9781492072942", "author": "Peter Bruce^Andrew Bruce", "discount": "41000"}]}"#,
    )
    .await;

    let items = client(endpoint).fetch_page(&request()).await.expect("page");
    let head = server.await.expect("server task");

    assert_eq!(items.len(), 1);
    assert_eq!(items[0].natural_key(), Some("9781492072942"));
    assert_eq!(items[0].discount.as_deref(), Some("41000"));

    let head_lower = head.to_ascii_lowercase();
    assert!(head_lower.contains("x-naver-client-id: test-id"));
    assert!(head_lower.contains("x-naver-client-secret: test-secret"));
    assert!(head.contains("query=Statistics"));
    assert!(head.contains("display=100"));
    assert!(head.contains("start=101"));
    assert!(head.contains("sort=sim"));
}

#[tokio::test]
async fn non_success_status_is_a_fetch_error() {
    let (endpoint, server) =
        one_shot_server("HTTP/1.1 429 Too Many Requests", r#"{"errorCode": "012"}"#).await;

    let err = client(endpoint)
        .fetch_page(&request())
        .await
        .expect_err("rate limited");
    server.await.expect("server task");

    assert!(err.is_rate_limited());
    assert!(matches!(err, FetchError::HttpStatus { status: 429, .. }));
}
