use std::{
    error::Error as _,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use kube_client::{AuthSource, CallError, Connection};
use kube_tokens::{sources::CredentialSource, AccessToken, Credential, TokenProvider};
use reqwest::{Method, StatusCode};
use serde_json::json;
use wiremock::{
    matchers::{body_json, header, method, path},
    Match, Mock, MockServer, Request, ResponseTemplate,
};

fn connection(server: &MockServer) -> Connection {
    Connection::new(server.uri().parse().unwrap())
}

struct NoAuthorization;

impl Match for NoAuthorization {
    fn matches(&self, request: &Request) -> bool {
        !request.headers.contains_key("authorization")
    }
}

#[derive(Debug, Default)]
struct CountingSource {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl CredentialSource for CountingSource {
    type Error = io::Error;

    async fn request_credential(&mut self) -> Result<Credential, Self::Error> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Credential::non_expiring(format!("counted-{}", n)))
    }
}

#[derive(Debug)]
struct BrokenSource;

#[async_trait]
impl CredentialSource for BrokenSource {
    type Error = io::Error;

    async fn request_credential(&mut self) -> Result<Credential, Self::Error> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "plugin refused"))
    }
}

#[tokio::test]
async fn anonymous_connection_sends_no_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/version"))
        .and(NoAuthorization)
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "major": "1" })))
        .expect(1)
        .mount(&server)
        .await;

    let body = connection(&server)
        .call(Method::GET, "/version", None)
        .await
        .unwrap();

    assert_eq!(&body[..], br#"{"major":"1"}"#);
}

#[tokio::test]
async fn fixed_token_is_sent_as_bearer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .and(header("authorization", "Bearer fixed"))
        .and(header("accept", "application/json"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    connection(&server)
        .with_token("fixed")
        .call(Method::GET, "/api", None)
        .await
        .unwrap();
}

#[tokio::test]
async fn request_body_is_sent_as_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/namespaces"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({ "metadata": { "name": "scratch" } })))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let body = serde_json::to_vec(&json!({ "metadata": { "name": "scratch" } })).unwrap();

    connection(&server)
        .call(Method::POST, "/api/v1/namespaces", Some(body.into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn error_status_carries_response_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/secrets"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
        .mount(&server)
        .await;

    let error = connection(&server)
        .call(Method::GET, "/api/v1/secrets", None)
        .await
        .unwrap_err();

    assert_eq!(error.status(), Some(StatusCode::UNAUTHORIZED));
    match error {
        CallError::ErrorWithBody { body, .. } => assert_eq!(body, "Unauthorized"),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn attached_provider_is_asked_once_per_credential() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .and(header("authorization", "Bearer counted-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&server)
        .await;

    let calls = Arc::new(AtomicUsize::new(0));
    let conn = connection(&server);
    conn.attach_source(CountingSource {
        calls: calls.clone(),
    });

    for _ in 0..3 {
        conn.call(Method::GET, "/api", None).await.unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_provider_prevents_the_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let conn = connection(&server);
    conn.attach_source(BrokenSource);

    let error = conn.call(Method::GET, "/api", None).await.unwrap_err();

    match &error {
        CallError::Authentication(auth) => {
            let cause = auth
                .source()
                .and_then(|s| s.downcast_ref::<io::Error>())
                .expect("original cause should be kept");
            assert_eq!(cause.kind(), io::ErrorKind::PermissionDenied);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn call_with_auth_overrides_then_restores() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/override"))
        .and(header("authorization", "Bearer temporary"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(1)
        .mount(&server)
        .await;

    let conn = connection(&server).with_token("usual");

    let error = conn
        .call_with_auth(
            AuthSource::Token(AccessToken::from_static("temporary")),
            Method::GET,
            "/override",
            None,
        )
        .await
        .unwrap_err();

    assert_eq!(error.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    assert!(matches!(conn.auth_source(), AuthSource::Token(t) if t.as_str() == "usual"));
}

#[tokio::test]
async fn call_with_auth_does_not_leak_into_concurrent_calls() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .and(header("authorization", "Bearer temporary"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .and(header("authorization", "Bearer usual"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let conn = connection(&server).with_token("usual");
    let other = conn.clone();

    let substituted = conn.call_with_auth(
        AuthSource::Token(AccessToken::from_static("temporary")),
        Method::GET,
        "/slow",
        None,
    );
    let concurrent = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        other.call(Method::GET, "/api", None).await
    };

    let (substituted, concurrent) = tokio::join!(substituted, concurrent);

    substituted.unwrap();
    concurrent.unwrap();
    assert!(matches!(conn.auth_source(), AuthSource::Token(t) if t.as_str() == "usual"));
}

#[tokio::test]
async fn call_with_auth_can_go_anonymous() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/healthz"))
        .and(NoAuthorization)
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let conn = connection(&server).with_token("usual");

    let body = conn
        .call_with_auth(AuthSource::Anonymous, Method::GET, "/healthz", None)
        .await
        .unwrap();

    assert_eq!(&body[..], b"ok");
    assert!(matches!(conn.auth_source(), AuthSource::Token(_)));
}

#[tokio::test]
async fn call_with_auth_pins_provider_before_swapping() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .and(header("authorization", "Bearer counted-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let conn = connection(&server).with_token("usual");
    let provider: Arc<dyn TokenProvider> = Arc::new(kube_tokens::CachedTokenProvider::new(
        CountingSource::default(),
    ));

    conn.call_with_auth(AuthSource::Provider(provider.clone()), Method::GET, "/api", None)
        .await
        .unwrap();

    assert!(!provider.is_expired());
    assert!(matches!(conn.auth_source(), AuthSource::Token(t) if t.as_str() == "usual"));
}

#[tokio::test]
async fn base_path_prefix_is_preserved() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/proxy/cluster-a/api"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let conn = Connection::new(
        format!("{}/proxy/cluster-a/", server.uri())
            .parse()
            .unwrap(),
    );

    conn.call(Method::GET, "/api", None).await.unwrap();
}
