use crate::auth::CredentialProvider;
use crate::error::MailError;
use crate::models::{Composition, Folder, MailFolderInfo, Message, Page, UserProfile};
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::client::connect::Connect;
use hyper::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Client, Method, Request, StatusCode};
use hyper_rustls::HttpsConnector;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// The remote mailbox as seen by the synchronizer and the search coordinator.
///
/// Implementations never retry `delete_message` or `send_message`.
#[async_trait]
pub trait MailGateway: Send + Sync {
    async fn list_folder_page(
        &self,
        folder: Folder,
        skip: usize,
        top: usize,
    ) -> Result<Vec<Message>, MailError>;

    async fn get_message(&self, id: &str) -> Result<Message, MailError>;

    async fn send_message(&self, composition: &Composition) -> Result<(), MailError>;

    async fn set_read(&self, id: &str, is_read: bool) -> Result<(), MailError>;

    async fn delete_message(&self, id: &str) -> Result<(), MailError>;

    /// Returns the moved copy when the server reports it. The copy usually
    /// carries a new id.
    async fn move_message(&self, id: &str, destination: Folder)
    -> Result<Option<Message>, MailError>;

    /// Server full-text search. `scope == None` searches every folder.
    async fn search(
        &self,
        term: &str,
        scope: Option<Folder>,
        skip: usize,
        top: usize,
    ) -> Result<Vec<Message>, MailError>;

    /// Subject/sender `$filter` query for servers that reject `$search`.
    async fn search_filter_fallback(
        &self,
        term: &str,
        scope: Option<Folder>,
        skip: usize,
        top: usize,
    ) -> Result<Vec<Message>, MailError>;

    async fn list_folders(&self) -> Result<Vec<MailFolderInfo>, MailError>;

    async fn get_profile(&self) -> Result<UserProfile, MailError>;
}

fn messages_root(scope: Option<Folder>) -> String {
    match scope {
        Some(folder) => format!("/me/mailFolders/{}/messages", folder.graph_id()),
        None => "/me/messages".to_string(),
    }
}

pub fn folder_page_path(folder: Folder, skip: usize, top: usize) -> String {
    format!(
        "{}?$top={}&$skip={}&$orderby=receivedDateTime%20desc",
        messages_root(Some(folder)),
        top,
        skip
    )
}

/// `$search` cannot be combined with `$orderby`, and `$skip` only when
/// non-zero; callers sort the results themselves.
pub fn search_path(term: &str, scope: Option<Folder>, skip: usize, top: usize) -> String {
    let quoted = format!("\"{}\"", term.trim().replace('"', ""));
    let mut path = format!(
        "{}?$search={}&$top={}",
        messages_root(scope),
        urlencoding::encode(&quoted),
        top
    );
    if skip > 0 {
        path.push_str(&format!("&$skip={}", skip));
    }
    path
}

pub fn filter_expression(term: &str) -> String {
    let escaped = term.trim().replace('\'', "''");
    format!(
        "contains(subject, '{0}') or contains(from/emailAddress/address, '{0}') or contains(from/emailAddress/name, '{0}')",
        escaped
    )
}

pub fn filter_path(term: &str, scope: Option<Folder>, skip: usize, top: usize) -> String {
    format!(
        "{}?$filter={}&$top={}&$skip={}&$orderby=receivedDateTime%20desc",
        messages_root(scope),
        urlencoding::encode(&filter_expression(term)),
        top,
        skip
    )
}

fn message_path(id: &str) -> String {
    format!("/me/messages/{}", urlencoding::encode(id))
}

/// Maps a finished response onto the gateway contract: non-2xx is an error
/// carrying the server's message, a 2xx without a parseable body is bare
/// success.
pub fn interpret_response(status: StatusCode, body: &[u8]) -> Result<Option<Value>, MailError> {
    if !status.is_success() {
        let message = error_message(body).unwrap_or_else(|| {
            status
                .canonical_reason()
                .map(str::to_string)
                .unwrap_or_else(|| format!("Graph API error: {}", status.as_u16()))
        });
        return Err(MailError::Api {
            status: status.as_u16(),
            message,
        });
    }

    if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
        return Ok(None);
    }
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(serde_json::from_slice(body).ok())
}

fn error_message(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value
        .pointer("/error/message")
        .or_else(|| value.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn decode<T: DeserializeOwned>(value: Option<Value>) -> Result<T, MailError> {
    let value = value.ok_or(MailError::EmptyResponse)?;
    Ok(serde_json::from_value(value)?)
}

fn decode_page<T: DeserializeOwned>(value: Option<Value>) -> Result<Vec<T>, MailError> {
    match value {
        Some(value) => Ok(serde_json::from_value::<Page<T>>(value)?.value),
        None => Ok(Vec::new()),
    }
}

/// Microsoft Graph mail client.
#[derive(Clone)]
pub struct GraphClient<C = HttpsConnector<HttpConnector>> {
    http: Client<C>,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl GraphClient {
    pub fn new(base_url: &str, credentials: Arc<dyn CredentialProvider>) -> std::io::Result<Self> {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()?
            .https_only()
            .enable_http1()
            .build();
        Ok(Self::with_client(
            Client::builder().build(connector),
            base_url,
            credentials,
        ))
    }
}

impl<C> GraphClient<C>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    pub fn with_client(
        http: Client<C>,
        base_url: &str,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        payload: Option<&Value>,
    ) -> Result<Option<Value>, MailError> {
        let idempotent = method == Method::GET;
        let mut backoff_secs = 1u64;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let token = self.credentials.acquire_token().await?;
            let builder = Request::builder()
                .method(method.clone())
                .uri(format!("{}{}", self.base_url, path))
                .header(AUTHORIZATION, format!("Bearer {}", token))
                .header(ACCEPT, "application/json");
            let request = match payload {
                Some(value) => builder
                    .header(CONTENT_TYPE, "application/json")
                    .body(hyper::Body::from(serde_json::to_vec(value)?)),
                None => builder.body(hyper::Body::empty()),
            }
            .map_err(|e| MailError::InvalidRequest(e.to_string()))?;

            debug!("graph {} {}", method, path);
            let response = self.http.request(request).await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS
                && idempotent
                && attempt < MAX_RATE_LIMIT_RETRIES
            {
                let wait = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(backoff_secs);
                warn!("graph throttled {}; retrying in {}s", path, wait);
                tokio::time::sleep(Duration::from_secs(wait)).await;
                backoff_secs = (backoff_secs * 2).min(32);
                continue;
            }

            let body = hyper::body::to_bytes(response.into_body()).await?;
            return interpret_response(status, &body);
        }

        Err(MailError::Network(format!(
            "{} {} exhausted retries",
            method, path
        )))
    }
}

#[async_trait]
impl<C> MailGateway for GraphClient<C>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    async fn list_folder_page(
        &self,
        folder: Folder,
        skip: usize,
        top: usize,
    ) -> Result<Vec<Message>, MailError> {
        let value = self
            .execute(Method::GET, &folder_page_path(folder, skip, top), None)
            .await?;
        decode_page(value)
    }

    async fn get_message(&self, id: &str) -> Result<Message, MailError> {
        decode(self.execute(Method::GET, &message_path(id), None).await?)
    }

    async fn send_message(&self, composition: &Composition) -> Result<(), MailError> {
        let payload = composition.to_send_payload();
        self.execute(Method::POST, "/me/sendMail", Some(&payload))
            .await?;
        Ok(())
    }

    async fn set_read(&self, id: &str, is_read: bool) -> Result<(), MailError> {
        let payload = json!({ "isRead": is_read });
        self.execute(Method::PATCH, &message_path(id), Some(&payload))
            .await?;
        Ok(())
    }

    async fn delete_message(&self, id: &str) -> Result<(), MailError> {
        self.execute(Method::DELETE, &message_path(id), None).await?;
        Ok(())
    }

    async fn move_message(
        &self,
        id: &str,
        destination: Folder,
    ) -> Result<Option<Message>, MailError> {
        let payload = json!({ "destinationId": destination.graph_id() });
        let value = self
            .execute(
                Method::POST,
                &format!("{}/move", message_path(id)),
                Some(&payload),
            )
            .await?;
        Ok(value.and_then(|v| serde_json::from_value(v).ok()))
    }

    async fn search(
        &self,
        term: &str,
        scope: Option<Folder>,
        skip: usize,
        top: usize,
    ) -> Result<Vec<Message>, MailError> {
        let value = self
            .execute(Method::GET, &search_path(term, scope, skip, top), None)
            .await?;
        decode_page(value)
    }

    async fn search_filter_fallback(
        &self,
        term: &str,
        scope: Option<Folder>,
        skip: usize,
        top: usize,
    ) -> Result<Vec<Message>, MailError> {
        let value = self
            .execute(Method::GET, &filter_path(term, scope, skip, top), None)
            .await?;
        decode_page(value)
    }

    async fn list_folders(&self) -> Result<Vec<MailFolderInfo>, MailError> {
        decode_page(self.execute(Method::GET, "/me/mailFolders", None).await?)
    }

    async fn get_profile(&self) -> Result<UserProfile, MailError> {
        decode(self.execute(Method::GET, "/me", None).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::Mutex;
    use std::thread;

    struct StaticToken;

    #[async_trait]
    impl CredentialProvider for StaticToken {
        async fn acquire_token(&self) -> Result<String, MailError> {
            Ok("test-token".to_string())
        }
    }

    /// Serves one canned response per connection and records request lines.
    struct MockGraph {
        port: u16,
        requests: Arc<Mutex<Vec<String>>>,
    }

    impl MockGraph {
        fn start(responses: Vec<(u16, &'static str)>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
            let port = listener.local_addr().unwrap().port();
            let requests = Arc::new(Mutex::new(Vec::new()));
            let seen = requests.clone();

            thread::spawn(move || {
                for (status, body) in responses {
                    let Ok((stream, _)) = listener.accept() else {
                        return;
                    };
                    Self::handle(stream, status, body, &seen);
                }
            });

            MockGraph { port, requests }
        }

        fn handle(
            mut stream: std::net::TcpStream,
            status: u16,
            body: &str,
            seen: &Mutex<Vec<String>>,
        ) {
            let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).is_err() {
                return;
            }
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                    break;
                }
                let lower = line.to_ascii_lowercase();
                if let Some(v) = lower.strip_prefix("content-length:") {
                    content_length = v.trim().parse().unwrap_or(0);
                }
            }
            let mut payload = vec![0u8; content_length];
            let _ = reader.read_exact(&mut payload);
            seen.lock()
                .unwrap()
                .push(format!("{}{}", request_line.trim_end(), String::from_utf8_lossy(&payload)));

            let response = format!(
                "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
        }

        fn client(&self) -> GraphClient<HttpConnector> {
            GraphClient::with_client(
                Client::new(),
                &format!("http://127.0.0.1:{}/v1.0/", self.port),
                Arc::new(StaticToken),
            )
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[test]
    fn test_folder_page_path() {
        assert_eq!(
            folder_page_path(Folder::Sent, 50, 25),
            "/me/mailFolders/sentitems/messages?$top=25&$skip=50&$orderby=receivedDateTime%20desc"
        );
    }

    #[test]
    fn test_search_path_scopes() {
        assert_eq!(
            search_path(" hello world ", Some(Folder::Inbox), 0, 50),
            "/me/mailFolders/inbox/messages?$search=%22hello%20world%22&$top=50"
        );
        assert_eq!(
            search_path("x", None, 10, 50),
            "/me/messages?$search=%22x%22&$top=50&$skip=10"
        );
    }

    #[test]
    fn test_filter_expression_escapes_quotes() {
        let expr = filter_expression("O'Brien");
        assert!(expr.starts_with("contains(subject, 'O''Brien')"));
        assert!(expr.contains("from/emailAddress/name, 'O''Brien'"));
        assert!(filter_path("a", None, 0, 5).starts_with("/me/messages?$filter=contains%28subject"));
    }

    #[test]
    fn test_interpret_response_variants() {
        assert!(
            interpret_response(StatusCode::NO_CONTENT, b"")
                .unwrap()
                .is_none()
        );
        assert!(interpret_response(StatusCode::OK, b"  ").unwrap().is_none());
        assert!(interpret_response(StatusCode::OK, b"not json").unwrap().is_none());
        assert_eq!(
            interpret_response(StatusCode::OK, br#"{"a":1}"#).unwrap(),
            Some(json!({"a": 1}))
        );

        let err = interpret_response(
            StatusCode::FORBIDDEN,
            br#"{"error":{"code":"ErrorAccessDenied","message":"Access is denied."}}"#,
        )
        .unwrap_err();
        match err {
            MailError::Api { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "Access is denied.");
            }
            other => panic!("unexpected error {:?}", other),
        }

        let err = interpret_response(StatusCode::NOT_FOUND, b"").unwrap_err();
        assert_eq!(err.to_string(), "Not Found (HTTP 404)");
    }

    #[tokio::test]
    async fn test_list_folder_page_over_http() {
        let server = MockGraph::start(vec![(
            200,
            r#"{"value":[{"id":"m1","subject":"Hi","receivedDateTime":"2024-01-01T00:00:00Z","isRead":true}]}"#,
        )]);
        let client = server.client();

        let page = client.list_folder_page(Folder::Inbox, 0, 50).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "m1");
        assert!(page[0].is_read);

        let requests = server.requests();
        assert!(requests[0].starts_with(
            "GET /v1.0/me/mailFolders/inbox/messages?$top=50&$skip=0"
        ));
    }

    #[tokio::test]
    async fn test_delete_accepts_empty_body() {
        let server = MockGraph::start(vec![(204, "")]);
        server.client().delete_message("m1").await.unwrap();
        assert!(server.requests()[0].starts_with("DELETE /v1.0/me/messages/m1"));
    }

    #[tokio::test]
    async fn test_move_returns_new_copy() {
        let server = MockGraph::start(vec![(201, r#"{"id":"m1-moved","subject":"Hi"}"#)]);
        let moved = server
            .client()
            .move_message("m1", Folder::Deleted)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.id, "m1-moved");
        let request = &server.requests()[0];
        assert!(request.starts_with("POST /v1.0/me/messages/m1/move"));
        assert!(request.contains(r#""destinationId":"deleteditems""#));
    }

    #[tokio::test]
    async fn test_search_rejection_is_query_unsupported() {
        let server = MockGraph::start(vec![(
            400,
            r#"{"error":{"message":"Search is not supported"}}"#,
        )]);
        let err = server
            .client()
            .search("x", Some(Folder::Inbox), 0, 50)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::QueryUnsupported);
    }

    #[tokio::test]
    async fn test_set_read_sends_patch() {
        let server = MockGraph::start(vec![(200, r#"{"id":"m1","isRead":true}"#)]);
        server.client().set_read("m1", true).await.unwrap();
        let request = &server.requests()[0];
        assert!(request.starts_with("PATCH /v1.0/me/messages/m1"));
        assert!(request.ends_with(r#"{"isRead":true}"#));
    }
}
