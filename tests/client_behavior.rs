//! HTTP-level behavior tests for the Dataverse client: pagination,
//! retry, the orderby fallback, and tenant discovery, driven against a
//! minimal scripted HTTP server on a loopback socket.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use dataverse_sync::auth::DataverseAuth;
use dataverse_sync::client::{DataverseClient, DataverseFetch};
use dataverse_sync::config::Config;
use dataverse_sync::error::SyncError;

struct CannedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl CannedResponse {
    fn json(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: body.into(),
        }
    }

    fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Bind a loopback listener and return it with the base URL it serves.
async fn bind_server() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, format!("http://{addr}/api"))
}

/// Serve a fixed sequence of responses, one per connection, then close.
/// Returns the base URL to aim the client at.
async fn serve_script(responses: Vec<CannedResponse>) -> String {
    let (listener, base) = bind_server().await;
    serve_on(listener, responses);
    base
}

fn serve_on(listener: TcpListener, responses: Vec<CannedResponse>) {
    let queue = Arc::new(Mutex::new(responses));

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                // Drain the request head; bodies are empty for GETs.
                let mut buf = vec![0u8; 8192];
                let mut request = Vec::new();
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) => return,
                        Ok(n) => {
                            request.extend_from_slice(&buf[..n]);
                            if request.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        Err(_) => return,
                    }
                }

                let response = queue.lock().await.pop();
                let Some(response) = response else {
                    return;
                };
                let mut head = format!(
                    "HTTP/1.1 {} canned\r\nContent-Length: {}\r\nConnection: close\r\n",
                    response.status,
                    response.body.len()
                );
                for (name, value) in &response.headers {
                    head.push_str(&format!("{name}: {value}\r\n"));
                }
                head.push_str("\r\n");
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(response.body.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
}

fn test_config(api_url: String) -> Config {
    Config {
        api_url,
        client_id: "client".into(),
        client_secret: "secret".into(),
        scope: "https://org.crm.dynamics.com/.default".into(),
        sqlite_db_path: Some(":memory:".into()),
        postgres_connection_string: None,
    }
}

// Responses are served newest-first from a Vec, so scripts are listed in
// reverse order of arrival.
fn script(mut responses: Vec<CannedResponse>) -> Vec<CannedResponse> {
    responses.reverse();
    responses
}

#[tokio::test]
async fn test_fetch_all_pages_follows_next_link() {
    // Bind first so the nextLink in page one can point back at the
    // same server.
    let (listener, base) = bind_server().await;
    let page1 = format!(
        r#"{{"value": [{{"accountid": "a1"}}, {{"accountid": "a2"}}], "@odata.nextLink": "{base}/accounts?page=2"}}"#
    );
    let page2 = r#"{"value": [{"accountid": "a3"}]}"#.to_string();
    serve_on(
        listener,
        script(vec![
            CannedResponse::json(200, page1),
            CannedResponse::json(200, page2),
        ]),
    );

    let client = DataverseClient::new(&test_config(base), "token".into()).unwrap();
    let records = client
        .fetch_all_pages("accounts", Some("accountid"), None, None)
        .await
        .unwrap();

    let ids: Vec<&str> = records
        .iter()
        .map(|r| r["accountid"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["a1", "a2", "a3"]);
}

#[tokio::test]
async fn test_orderby_rejection_falls_back_to_single_page() {
    let rejection = r#"{"error": {"message": "The orderby attribute is not supported for paging"}}"#;
    let degraded = r#"{"value": [{"accountid": "a1"}, {"accountid": "a2"}],
                       "@odata.nextLink": "http://ignored.example/next"}"#;
    let base = serve_script(script(vec![
        CannedResponse::json(400, rejection),
        CannedResponse::json(200, degraded),
    ]))
    .await;

    let client = DataverseClient::new(&test_config(base), "token".into()).unwrap();
    let records = client
        .fetch_all_pages("accounts", Some("accountid"), None, None)
        .await
        .unwrap();

    // Truncated single page accepted; the continuation is not followed.
    assert_eq!(records.len(), 2);
}

#[tokio::test]
async fn test_rate_limited_request_is_retried() {
    let base = serve_script(script(vec![
        CannedResponse::json(429, "{}").with_header("Retry-After", "1"),
        CannedResponse::json(200, r#"{"value": [{"accountid": "a1"}]}"#),
    ]))
    .await;

    let client = DataverseClient::new(&test_config(base), "token".into()).unwrap();
    let records = client.fetch_all_pages("accounts", None, None, None).await.unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let base = serve_script(script(vec![
        CannedResponse::json(503, "busy"),
        CannedResponse::json(200, r#"{"value": []}"#),
    ]))
    .await;

    let client = DataverseClient::new(&test_config(base), "token".into()).unwrap();
    let records = client.fetch_all_pages("accounts", None, None, None).await.unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn test_unauthorized_fails_without_retry() {
    let base = serve_script(script(vec![CannedResponse::json(401, "")])).await;

    let client = DataverseClient::new(&test_config(base), "token".into()).unwrap();
    let result = client.fetch_all_pages("accounts", None, None, None).await;
    assert!(matches!(result, Err(SyncError::Auth(_))));
}

#[tokio::test]
async fn test_client_error_fails_immediately() {
    let base = serve_script(script(vec![CannedResponse::json(
        404,
        r#"{"error": {"message": "entity set does not exist"}}"#,
    )]))
    .await;

    let client = DataverseClient::new(&test_config(base), "token".into()).unwrap();
    let result = client.fetch_all_pages("missing_things", None, None, None).await;
    assert!(matches!(result, Err(SyncError::Server { status: 404, .. })));
}

#[tokio::test]
async fn test_get_metadata_returns_xml_text() {
    let xml = r#"<?xml version="1.0"?><edmx:Edmx Version="4.0"></edmx:Edmx>"#;
    let base = serve_script(script(vec![CannedResponse {
        status: 200,
        headers: vec![("Content-Type".into(), "application/xml".into())],
        body: xml.to_string(),
    }]))
    .await;

    let client = DataverseClient::new(&test_config(base), "token".into()).unwrap();
    let metadata = client.get_metadata().await.unwrap();
    assert_eq!(metadata, xml);
}

#[tokio::test]
async fn test_get_entity_count_parses_bare_integer() {
    let base = serve_script(script(vec![CannedResponse::json(200, "42")])).await;
    let client = DataverseClient::new(&test_config(base), "token".into()).unwrap();
    assert_eq!(client.get_entity_count("accounts").await.unwrap(), 42);
}

#[tokio::test]
async fn test_tenant_discovery_from_www_authenticate() {
    let base = serve_script(script(vec![CannedResponse::json(401, "").with_header(
        "WWW-Authenticate",
        "Bearer authorization_uri=\"https://login.microsoftonline.com/11111111-2222-3333-4444-555555555555/oauth2/authorize\"",
    )]))
    .await;

    let mut auth = DataverseAuth::new(test_config(base)).unwrap();
    let tenant = auth.discover_tenant_id().await.unwrap();
    assert_eq!(tenant, "11111111-2222-3333-4444-555555555555");
}
