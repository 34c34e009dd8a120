//! A small HTTP client for talking to upstream origins.
//!
//! The client never follows redirects and never retries on its own: callers that
//! proxy traffic need to see every upstream status and decide for themselves.

use std::time::Duration;

use http::{Method, Uri};
use hyperdriver::client::conn::transport::tcp::TcpTransportConfig;
use hyperdriver::service::SharedService;
use hyperdriver::Client;
use tower::ServiceExt;

use crate::request::RequestExt as _;

mod error;
pub mod request;
pub mod response;
pub mod uri;

pub use self::error::Error;
pub use self::request::{copy_headers, RequestBuilder};
pub use self::response::Response;

/// A boxed, `Send` future.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_USER_AGENT: &str = concat!("ghproxy/", env!("CARGO_PKG_VERSION"));

/// Settings for the transport underneath an [`UpstreamClient`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Time allowed to establish a TCP connection.
    pub connect_timeout: Duration,

    /// Time allowed for a request to produce response headers.
    pub timeout: Duration,

    /// User agent sent when the request does not carry one.
    pub user_agent: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

/// A client for sending requests to upstream servers over HTTP / HTTPS
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    inner: hyperdriver::client::SharedClientService<hyperdriver::Body, hyperdriver::Body>,
}

impl UpstreamClient {
    /// Create a new client using TCP with TLS, negotiating HTTP/1.1 or HTTP/2.
    pub fn new(settings: &ClientSettings) -> Self {
        let mut tcp = TcpTransportConfig::default();
        tcp.connect_timeout = Some(settings.connect_timeout);

        let inner = Client::builder()
            .with_tcp(tcp)
            .with_default_tls()
            .with_auto_http()
            .with_user_agent(settings.user_agent.clone())
            .with_timeout(settings.timeout)
            .build_service();

        UpstreamClient { inner }
    }

    /// Create a client on top of any compatible service, e.g. [`mock::MockService`].
    pub fn new_with_inner_service<S>(inner: S) -> Self
    where
        S: tower::Service<
                http::Request<hyperdriver::Body>,
                Response = http::Response<hyperdriver::Body>,
                Error = hyperdriver::client::Error,
            > + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let inner = tower::ServiceBuilder::new()
            .layer(SharedService::layer())
            .service(inner);

        UpstreamClient { inner }
    }

    /// Start building a request with any method.
    pub fn request(&self, method: Method, uri: Uri) -> RequestBuilder {
        RequestBuilder::new(self.clone(), uri, method)
    }

    /// Start building a `GET` request.
    pub fn get(&self, uri: Uri) -> RequestBuilder {
        self.request(Method::GET, uri)
    }

    /// Send a request, keeping its parts alongside the response.
    pub async fn execute(&self, req: http::Request<hyperdriver::Body>) -> Result<Response, Error> {
        let parts = req.parts();
        tracing::trace!(method = %parts.method, uri = %parts.uri, "sending upstream request");

        let response = self.inner.clone().oneshot(req).await?;
        Ok(Response::new(parts, response))
    }
}

pub mod mock {
    //! A scripted upstream for tests.

    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;

    use bytes::Bytes;
    use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
    use parking_lot::Mutex;

    /// A canned response.
    #[derive(Debug, Clone)]
    pub struct MockResponse {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    }

    impl MockResponse {
        /// A response with `status`, no headers and an empty body.
        pub fn new(status: StatusCode) -> Self {
            Self {
                status,
                headers: HeaderMap::new(),
                body: Bytes::new(),
            }
        }

        /// Append a header.
        pub fn header(mut self, name: HeaderName, value: &str) -> Self {
            self.headers.append(
                name,
                HeaderValue::from_str(value).expect("valid mock header value"),
            );
            self
        }

        /// Set the body.
        pub fn body(mut self, body: impl Into<Bytes>) -> Self {
            self.body = body.into();
            self
        }
    }

    /// A request seen by the [`MockService`].
    #[derive(Debug, Clone)]
    pub struct RecordedRequest {
        /// Request method
        pub method: Method,

        /// Full request URI, including the query
        pub uri: Uri,

        /// Request headers as received
        pub headers: HeaderMap,

        /// Collected request body
        pub body: Bytes,
    }

    impl RecordedRequest {
        /// `host` + `path`, the key used to look up responses.
        pub fn key(&self) -> String {
            route_key(&self.uri)
        }
    }

    fn route_key(uri: &Uri) -> String {
        format!("{}{}", uri.host().unwrap_or_default(), uri.path())
    }

    #[derive(Debug, Default)]
    struct State {
        responses: HashMap<String, VecDeque<MockResponse>>,
        requests: Vec<RecordedRequest>,
    }

    /// Responds to requests by `host` + `path` with scripted responses.
    ///
    /// Responses queued for the same route are returned in order, and the last one
    /// is repeated once the queue is down to a single entry.
    #[derive(Debug, Default, Clone)]
    pub struct MockService {
        state: Arc<Mutex<State>>,
    }

    impl MockService {
        /// An empty mock with no routes configured.
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a response for requests to `route` (`host` + `path`, no scheme or query).
        pub fn add(&self, route: &str, response: MockResponse) {
            self.state
                .lock()
                .responses
                .entry(route.to_owned())
                .or_default()
                .push_back(response);
        }

        /// All requests received so far, in order.
        pub fn requests(&self) -> Vec<RecordedRequest> {
            self.state.lock().requests.clone()
        }

        /// Requests received for a single route.
        pub fn requests_to(&self, route: &str) -> Vec<RecordedRequest> {
            self.requests()
                .into_iter()
                .filter(|req| req.key() == route)
                .collect()
        }
    }

    impl tower::Service<http::Request<hyperdriver::Body>> for MockService {
        type Response = http::Response<hyperdriver::Body>;
        type Error = hyperdriver::client::Error;
        type Future = crate::BoxFuture<'static, Result<Self::Response, Self::Error>>;

        fn poll_ready(
            &mut self,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<hyperdriver::Body>) -> Self::Future {
            let state = self.state.clone();
            Box::pin(async move {
                use http_body_util::BodyExt as _;

                let (parts, body) = req.into_parts();
                let body = body
                    .collect()
                    .await
                    .map(|collected| collected.to_bytes())
                    .unwrap_or_default();

                let recorded = RecordedRequest {
                    method: parts.method,
                    uri: parts.uri,
                    headers: parts.headers,
                    body,
                };
                let key = recorded.key();

                let response = {
                    let mut state = state.lock();
                    state.requests.push(recorded);
                    let queue = state
                        .responses
                        .get_mut(&key)
                        .unwrap_or_else(|| panic!("No response configured for route: {key}"));
                    if queue.len() > 1 {
                        queue.pop_front().expect("queue is not empty")
                    } else {
                        queue
                            .front()
                            .cloned()
                            .unwrap_or_else(|| panic!("No response configured for route: {key}"))
                    }
                };

                let mut builder = http::Response::builder()
                    .status(response.status)
                    .version(http::Version::HTTP_11);

                for (key, value) in response.headers.iter() {
                    builder = builder.header(key, value);
                }

                Ok(builder
                    .body(hyperdriver::Body::from(response.body))
                    .expect("valid mock response"))
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::mock::{MockResponse, MockService};
    use super::*;

    #[test]
    fn extensions_produce_send_futures() {
        let client = UpstreamClient::new(&ClientSettings::default());
        let builder = client.get("http://registry.test/v2/".parse().unwrap());

        fn assert_send<T: Send>(_t: T) {}

        let fut = builder.send();
        assert_send(fut);
    }

    #[tokio::test]
    async fn mock_client_works() {
        let mock = MockService::new();
        mock.add(
            "registry.test/v2/",
            MockResponse::new(http::StatusCode::OK).body("frobulator"),
        );

        let client = UpstreamClient::new_with_inner_service(mock.clone());

        let response = client
            .get("http://registry.test/v2/?n=1".parse().unwrap())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(response.uri().query(), Some("n=1"));
        assert_eq!(response.text().await.unwrap(), "frobulator");
        assert_eq!(mock.requests_to("registry.test/v2/").len(), 1);
    }

    #[tokio::test]
    async fn mock_plays_queue_then_repeats_last() {
        let mock = MockService::new();
        mock.add(
            "registry.test/v2/a/b",
            MockResponse::new(http::StatusCode::UNAUTHORIZED),
        );
        mock.add("registry.test/v2/a/b", MockResponse::new(http::StatusCode::OK));
        let client = UpstreamClient::new_with_inner_service(mock.clone());

        let uri: Uri = "https://registry.test/v2/a/b".parse().unwrap();
        let statuses = [
            client.get(uri.clone()).send().await.unwrap().status(),
            client.get(uri.clone()).send().await.unwrap().status(),
            client.get(uri).send().await.unwrap().status(),
        ];
        assert_eq!(
            statuses,
            [
                http::StatusCode::UNAUTHORIZED,
                http::StatusCode::OK,
                http::StatusCode::OK
            ]
        );
    }

    #[tokio::test]
    async fn json_bodies_decode() {
        #[derive(Debug, serde::Deserialize)]
        struct Token {
            token: String,
        }

        let mock = MockService::new();
        mock.add(
            "auth.test/token",
            MockResponse::new(http::StatusCode::OK).body(r#"{"token":"abc","expires_in":300}"#),
        );
        let client = UpstreamClient::new_with_inner_service(mock);
        let token: Token = client
            .get("https://auth.test/token".parse().unwrap())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(token.token, "abc");
    }
}
