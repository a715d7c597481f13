//! HTTP transport for package delivery and pull.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, EXPECT};
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, info, info_span, warn};

use super::Transport;
use super::remote::{PendingAcks, RemoteAck, RemotePackage};
use crate::domain::DistributionRequest;
use crate::error::{Result, ShuttleError};
use crate::ports::secret_provider::{self, SecretProvider};
use crate::ports::{DistributionPackage, PackageBuilder};

/// Id of the package on the sending side, used to acknowledge a pull.
pub const PACKAGE_ID_HEADER: &str = "X-Shuttle-Package-Id";
const DIGEST_HEADER: &str = "Digest";
const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    /// Whole-request timeout once connected.
    pub socket_timeout: Duration,
    /// Send `Expect: 100-continue` with package bodies.
    pub expect_continue: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            socket_timeout: Duration::from_secs(10),
            expect_continue: true,
        }
    }
}

/// HTTP clients keyed by endpoint `host:port`.
///
/// Transports to the same host and port share connections; different
/// endpoints never do.
#[derive(Debug, Default)]
pub struct ClientPool {
    config: TransportConfig,
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl ClientPool {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn client_for(&self, endpoint: &Url) -> Result<reqwest::Client> {
        let key = host_port(endpoint)
            .ok_or_else(|| ShuttleError::configuration(format!("endpoint {endpoint} has no host")))?;
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.socket_timeout)
            .build()
            .map_err(|e| ShuttleError::configuration(format!("failed to build HTTP client: {e}")))?;
        debug!(endpoint = %key, "http client created");
        clients.insert(key, client.clone());
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn host_port(url: &Url) -> Option<String> {
    Some(format!("{}:{}", url.host_str()?, url.port_or_known_default()?))
}

/// Credentials resolved from the secret provider.
#[derive(Debug, Clone)]
pub(crate) enum Credentials {
    Header(String),
    Basic { username: String, password: String },
}

impl Credentials {
    fn from_secret(secret: &HashMap<String, String>) -> Option<Self> {
        if let Some(header) = secret.get(secret_provider::AUTHORIZATION) {
            return Some(Self::Header(header.clone()));
        }
        let username = secret.get(secret_provider::USERNAME)?;
        Some(Self::Basic {
            username: username.clone(),
            password: secret
                .get(secret_provider::PASSWORD)
                .cloned()
                .unwrap_or_default(),
        })
    }

    pub(crate) fn apply(credentials: Option<&Self>, request: RequestBuilder) -> RequestBuilder {
        match credentials {
            Some(Self::Header(value)) => request.header(AUTHORIZATION, value),
            Some(Self::Basic { username, password }) => request.basic_auth(username, Some(password)),
            None => request,
        }
    }
}

/// Map a response status to the transport's error families.
pub fn classify_status(endpoint: &str, status: StatusCode) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND => Err(ShuttleError::recoverable(format!(
            "endpoint {endpoint} answered {status}"
        ))),
        _ => Err(ShuttleError::fatal(format!(
            "endpoint {endpoint} answered {status}"
        ))),
    }
}

pub(crate) fn classify_send_error(endpoint: &str, err: reqwest::Error) -> ShuttleError {
    if err.is_connect() {
        ShuttleError::recoverable(format!("endpoint {endpoint} unreachable: {err}"))
    } else {
        ShuttleError::fatal(format!("request to {endpoint} failed: {err}"))
    }
}

pub struct HttpTransport {
    uri: String,
    endpoint: Url,
    pool: Arc<ClientPool>,
    secrets: Arc<dyn SecretProvider>,
    packages: Arc<dyn PackageBuilder>,
    pending_acks: Arc<PendingAcks>,
}

impl HttpTransport {
    /// # Errors
    /// `Configuration` when `uri` is not an absolute URL with a host.
    pub fn new(
        uri: impl Into<String>,
        pool: Arc<ClientPool>,
        secrets: Arc<dyn SecretProvider>,
        packages: Arc<dyn PackageBuilder>,
    ) -> Result<Self> {
        let uri = uri.into();
        let endpoint = Url::parse(&uri)
            .map_err(|e| ShuttleError::configuration(format!("invalid endpoint '{uri}': {e}")))?;
        if host_port(&endpoint).is_none() {
            return Err(ShuttleError::configuration(format!(
                "endpoint '{uri}' has no host"
            )));
        }
        Ok(Self {
            uri,
            endpoint,
            pool,
            secrets,
            packages,
            pending_acks: Arc::new(PendingAcks::default()),
        })
    }

    /// Pulled packages whose acknowledgment has not reached this endpoint yet.
    pub fn pending_acks(&self) -> usize {
        self.pending_acks.len()
    }

    async fn credentials(&self) -> Option<Credentials> {
        let secret = self.secrets.get_secret(&self.uri).await?;
        Credentials::from_secret(&secret)
    }

    /// Whether `package` came from this endpoint's host and port.
    fn is_origin_of(&self, package: &dyn DistributionPackage) -> bool {
        package
            .info()
            .origin_uri()
            .and_then(|origin| Url::parse(origin).ok())
            .is_some_and(|origin| host_port(&origin) == host_port(&self.endpoint))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn endpoint(&self) -> &str {
        &self.uri
    }

    async fn deliver_package(&self, package: &dyn DistributionPackage) -> Result<()> {
        if self.is_origin_of(package) {
            debug!(
                endpoint = %self.uri,
                package_id = package.id(),
                "package came from this endpoint, not sending it back"
            );
            return Ok(());
        }

        let span = info_span!(
            "deliver_package",
            endpoint = %self.uri,
            package_id = package.id(),
            size = package.size()
        );

        async move {
            let body = package.read().await?;
            let client = self.pool.client_for(&self.endpoint)?;

            let mut request = client
                .post(self.endpoint.clone())
                .header(CONTENT_TYPE, OCTET_STREAM)
                .header(PACKAGE_ID_HEADER, package.id())
                .body(body);
            if self.pool.config().expect_continue {
                request = request.header(EXPECT, "100-continue");
            }
            if let Some(checksum) = package.checksum() {
                request = request.header(DIGEST_HEADER, checksum);
            }
            let credentials = self.credentials().await;
            request = Credentials::apply(credentials.as_ref(), request);

            let response = request
                .send()
                .await
                .map_err(|err| classify_send_error(&self.uri, err))?;
            classify_status(&self.uri, response.status())?;

            info!(status = response.status().as_u16(), "package delivered");
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn retrieve_package(
        &self,
        request: &DistributionRequest,
    ) -> Result<Option<Arc<dyn DistributionPackage>>> {
        let span = info_span!("retrieve_package", endpoint = %self.uri);

        async move {
            let pending = self.pending_acks.retry().await;
            if pending > 0 {
                warn!(pending, "acknowledgments still pending");
            }
            let client = self.pool.client_for(&self.endpoint)?;
            let mut query: Vec<(&str, &str)> = vec![("action", request.request_type.as_str())];
            query.extend(request.paths.iter().map(|path| ("path", path.as_str())));
            query.extend(request.deep_paths.iter().map(|path| ("deep", path.as_str())));

            let credentials = self.credentials().await;
            let response = Credentials::apply(
                credentials.as_ref(),
                client.post(self.endpoint.clone()).query(&query),
            )
            .send()
            .await
            .map_err(|err| classify_send_error(&self.uri, err))?;
            classify_status(&self.uri, response.status())?;

            if response.status() == StatusCode::NO_CONTENT {
                debug!("nothing to pull");
                return Ok(None);
            }
            let remote_id = response
                .headers()
                .get(PACKAGE_ID_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let body = response
                .bytes()
                .await
                .map_err(|err| ShuttleError::fatal(format!("could not read package body: {err}")))?;
            if body.is_empty() {
                debug!("nothing to pull");
                return Ok(None);
            }

            let package = self.packages.read_package(body).await?;
            let remote_id = remote_id.unwrap_or_else(|| package.id().to_string());
            let ack = RemoteAck::new(client, self.endpoint.clone(), self.uri.clone(), credentials);
            let package = RemotePackage::new(
                package,
                &self.uri,
                remote_id,
                ack,
                self.pending_acks.clone(),
            );
            info!(
                package_id = package.id(),
                remote_id = package.remote_id(),
                "package retrieved"
            );
            Ok(Some(package as Arc<dyn DistributionPackage>))
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bytes::Bytes;
    use rstest::rstest;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

    use super::*;
    use crate::domain::PackageInfo;
    use crate::impls::{InMemoryPackageBuilder, StaticSecretProvider, encode_simple};

    fn config() -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(2),
            socket_timeout: Duration::from_secs(5),
            expect_continue: false,
        }
    }

    fn transport(
        uri: &str,
        secrets: StaticSecretProvider,
        packages: Arc<InMemoryPackageBuilder>,
    ) -> HttpTransport {
        HttpTransport::new(
            uri,
            Arc::new(ClientPool::new(config())),
            Arc::new(secrets),
            packages,
        )
        .unwrap()
    }

    fn secret(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[rstest]
    #[case(200, None)]
    #[case(204, None)]
    #[case(401, Some(true))]
    #[case(404, Some(true))]
    #[case(400, Some(false))]
    #[case(500, Some(false))]
    #[case(503, Some(false))]
    fn status_classification(#[case] code: u16, #[case] recoverable: Option<bool>) {
        let status = StatusCode::from_u16(code).unwrap();
        let result = classify_status("http://publish:4503/receive", status);
        assert_eq!(result.err().map(|err| err.is_recoverable()), recoverable);
    }

    #[tokio::test]
    async fn deliver_posts_package_bytes_with_basic_auth() {
        let server = MockServer::start().await;
        let uri = format!("{}/receive", server.uri());
        let builder = Arc::new(InMemoryPackageBuilder::new());
        let package = builder
            .create_package(&DistributionRequest::add(["/content/a"]))
            .await
            .unwrap();

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/receive"))
            .and(matchers::header("content-type", OCTET_STREAM))
            .and(matchers::header(PACKAGE_ID_HEADER, package.id()))
            .and(matchers::header("authorization", "Basic YWRtaW46c2VjcmV0"))
            .and(matchers::body_bytes(b"DSTRPCK:ADD|/content/a".to_vec()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let secrets = StaticSecretProvider::default()
            .with_secret(&uri, secret(&[("username", "admin"), ("password", "secret")]));
        transport(&uri, secrets, builder)
            .deliver_package(package.as_ref())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deliver_sends_digest_and_prebuilt_authorization() {
        let server = MockServer::start().await;
        let uri = format!("{}/receive", server.uri());
        let builder = Arc::new(InMemoryPackageBuilder::new());
        let package = builder.create_raw(
            PackageInfo::new(),
            Bytes::from_static(b"\x00binary"),
            Some("sha-256=abc".to_string()),
        );

        Mock::given(matchers::method("POST"))
            .and(matchers::header("digest", "sha-256=abc"))
            .and(matchers::header("authorization", "Bearer token"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let secrets = StaticSecretProvider::default()
            .with_secret(&uri, secret(&[("authorization", "Bearer token")]));
        transport(&uri, secrets, builder)
            .deliver_package(package.as_ref())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn not_found_is_recoverable_and_server_error_fatal() {
        let server = MockServer::start().await;
        Mock::given(matchers::path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(matchers::path("/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let builder = Arc::new(InMemoryPackageBuilder::new());
        let package = builder
            .create_package(&DistributionRequest::add(["/content/a"]))
            .await
            .unwrap();

        let gone = transport(&format!("{}/gone", server.uri()), StaticSecretProvider::default(), builder.clone());
        let err = gone.deliver_package(package.as_ref()).await.unwrap_err();
        assert!(matches!(err, ShuttleError::Recoverable { .. }));

        let broken = transport(&format!("{}/broken", server.uri()), StaticSecretProvider::default(), builder);
        let err = broken.deliver_package(package.as_ref()).await.unwrap_err();
        assert!(matches!(err, ShuttleError::Fatal { .. }));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_recoverable() {
        let builder = Arc::new(InMemoryPackageBuilder::new());
        let package = builder
            .create_package(&DistributionRequest::add(["/content/a"]))
            .await
            .unwrap();

        let err = transport("http://127.0.0.1:1/receive", StaticSecretProvider::default(), builder)
            .deliver_package(package.as_ref())
            .await
            .unwrap_err();
        assert!(err.is_recoverable(), "{err}");
    }

    #[tokio::test]
    async fn package_is_not_sent_back_to_its_origin() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let builder = Arc::new(InMemoryPackageBuilder::new());
        let info = PackageInfo::new().with(
            PackageInfo::ORIGIN_URI,
            format!("{}/pull-source", server.uri()),
        );
        let package = builder.create_raw(info, Bytes::from_static(b"data"), None);

        transport(&format!("{}/receive", server.uri()), StaticSecretProvider::default(), builder)
            .deliver_package(package.as_ref())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pull_reads_package_and_acknowledges_on_final_release() {
        let server = MockServer::start().await;
        let uri = format!("{}/exporter", server.uri());

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/exporter"))
            .and(matchers::query_param("action", "PULL"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(PACKAGE_ID_HEADER, "remote-7")
                    .set_body_bytes(encode_simple(&DistributionRequest::add(["/content/a"])).to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/exporter"))
            .and(matchers::query_param("operation", "delete"))
            .and(matchers::query_param("id", "remote-7"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let builder = Arc::new(InMemoryPackageBuilder::new());
        let package = transport(&uri, StaticSecretProvider::default(), builder.clone())
            .retrieve_package(&DistributionRequest::pull())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(package.info().origin_uri(), Some(uri.as_str()));
        assert_eq!(package.info().paths(), vec!["/content/a".to_string()]);
        builder.install_package(package.clone()).await.unwrap();

        let shared = package.as_shared().unwrap();
        shared.acquire(&["q1", "q2"]).await.unwrap();
        assert!(!shared.release(&["q1"]).await.unwrap());
        assert!(shared.release(&["q2"]).await.unwrap());
        assert!(builder.get_package(package.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_acknowledgment_is_retried_before_next_pull() {
        let server = MockServer::start().await;
        let uri = format!("{}/exporter", server.uri());

        Mock::given(matchers::method("POST"))
            .and(matchers::query_param("action", "PULL"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(PACKAGE_ID_HEADER, "remote-8")
                    .set_body_bytes(encode_simple(&DistributionRequest::add(["/content/a"])).to_vec()),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(matchers::method("POST"))
            .and(matchers::query_param("action", "PULL"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(matchers::method("POST"))
            .and(matchers::query_param("operation", "delete"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(matchers::method("POST"))
            .and(matchers::query_param("operation", "delete"))
            .and(matchers::query_param("id", "remote-8"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let builder = Arc::new(InMemoryPackageBuilder::new());
        let transport = transport(&uri, StaticSecretProvider::default(), builder.clone());
        let package = transport
            .retrieve_package(&DistributionRequest::pull())
            .await
            .unwrap()
            .unwrap();
        builder.install_package(package.clone()).await.unwrap();

        let shared = package.as_shared().unwrap();
        shared.acquire(&["q1"]).await.unwrap();
        assert!(shared.release(&["q1"]).await.is_err());
        assert_eq!(transport.pending_acks(), 1);
        assert!(builder.get_package(package.id()).await.unwrap().is_some());

        let pulled = transport
            .retrieve_package(&DistributionRequest::pull())
            .await
            .unwrap();
        assert!(pulled.is_none());
        assert_eq!(transport.pending_acks(), 0);
        assert!(builder.get_package(package.id()).await.unwrap().is_none());
        assert_eq!(builder.deletions(), 1);
    }

    #[tokio::test]
    async fn pull_with_no_content_yields_nothing() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let builder = Arc::new(InMemoryPackageBuilder::new());
        let pulled = transport(&server.uri(), StaticSecretProvider::default(), builder)
            .retrieve_package(&DistributionRequest::pull())
            .await
            .unwrap();
        assert!(pulled.is_none());
    }

    #[test]
    fn clients_are_shared_per_host_and_port() {
        let pool = ClientPool::new(config());
        pool.client_for(&Url::parse("http://publish:4503/a").unwrap()).unwrap();
        pool.client_for(&Url::parse("http://publish:4503/b").unwrap()).unwrap();
        pool.client_for(&Url::parse("http://publish:4504/a").unwrap()).unwrap();
        pool.client_for(&Url::parse("https://backup/receive").unwrap()).unwrap();
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn relative_endpoint_is_rejected() {
        let err = HttpTransport::new(
            "/receive",
            Arc::new(ClientPool::default()),
            Arc::new(StaticSecretProvider::default()),
            Arc::new(InMemoryPackageBuilder::new()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ShuttleError::Configuration { .. }));
    }
}
