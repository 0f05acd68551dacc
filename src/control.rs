use crate::error::ControlError;
use crate::model::{
    ApiErrorBody, DashboardStats, LoadBalancerStrategy, Node, NodeLogs, SpeedTestResult,
    StartNodeRequest, StatusResponse, Strategy,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{RootCertStore, SignatureScheme};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_LOG_LINES: u32 = 100;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Control-plane operations the orchestrator drives.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>, ControlError>;

    async fn start_node(&self, country: &str, server: Option<&str>)
        -> Result<Node, ControlError>;

    async fn stop_node(&self, node_id: &str) -> Result<StatusResponse, ControlError>;

    async fn restart_node(&self, node_id: &str) -> Result<StatusResponse, ControlError>;

    async fn node_details(&self, node_id: &str) -> Result<Node, ControlError>;

    async fn node_logs(&self, node_id: &str, lines: u32) -> Result<NodeLogs, ControlError>;

    async fn available_countries(&self) -> Result<Vec<String>, ControlError>;

    async fn run_speed_test(&self, node_id: &str) -> Result<SpeedTestResult, ControlError>;
}

#[derive(Clone, Debug)]
pub struct ControlSettings {
    pub api_url: String,
    pub username: String,
    pub password: String,
    pub tls_pin: Option<String>,
    pub timeout: Duration,
}

/// Stateless HTTP transport for the control plane.
///
/// The base URL and credential header are fixed at construction. Failures are never retried.
pub struct ControlClient {
    base_url: String,
    auth_header: String,
    client: reqwest::Client,
}

impl ControlClient {
    pub fn new(settings: ControlSettings) -> Result<Self> {
        let base_url = normalize_base_url(&settings.api_url);
        if base_url.is_empty() {
            return Err(anyhow!("API URL not configured"));
        }
        let client = build_http_client(settings.tls_pin, settings.timeout)?;
        Ok(Self {
            base_url,
            auth_header: basic_auth_header(&settings.username, &settings.password),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.endpoint(path))
            .header(AUTHORIZATION, &self.auth_header)
            .header(CONTENT_TYPE, "application/json")
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ControlError> {
        let response = request
            .send()
            .await
            .map_err(|err| ControlError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = normalize_error(status, &body);
            log::debug!("control request failed: {}", err);
            return Err(err);
        }
        response
            .json()
            .await
            .map_err(|err| ControlError::Decode(err.to_string()))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ControlError> {
        self.send(self.request(reqwest::Method::GET, path)).await
    }

    pub async fn load_balancer_strategy(&self) -> Result<LoadBalancerStrategy, ControlError> {
        self.get("/api/load-balancer/strategy").await
    }

    pub async fn set_load_balancer_strategy(
        &self,
        strategy: Strategy,
    ) -> Result<LoadBalancerStrategy, ControlError> {
        self.send(
            self.request(reqwest::Method::POST, "/api/load-balancer/strategy")
                .json(&LoadBalancerStrategy { strategy }),
        )
        .await
    }

    pub async fn dashboard_stats(&self) -> Result<DashboardStats, ControlError> {
        self.get("/api/stats").await
    }

    pub async fn country_servers(&self, country: &str) -> Result<Vec<String>, ControlError> {
        self.get(&format!("/api/config/servers/{}", country)).await
    }

    pub async fn all_servers(&self) -> Result<HashMap<String, Vec<String>>, ControlError> {
        self.get("/api/config/servers").await
    }

    pub async fn best_node(&self, country: &str) -> Result<Option<Node>, ControlError> {
        self.get(&format!("/api/load-balancer/best-node/{}", country))
            .await
    }

    pub async fn speed_test_results(
        &self,
        node_id: Option<&str>,
    ) -> Result<Vec<SpeedTestResult>, ControlError> {
        match node_id {
            Some(node_id) => {
                self.get(&format!("/api/speed-test/results/{}", node_id))
                    .await
            }
            None => self.get("/api/speed-test/results").await,
        }
    }
}

#[async_trait]
impl ControlPlane for ControlClient {
    async fn list_nodes(&self) -> Result<Vec<Node>, ControlError> {
        self.get("/api/nodes").await
    }

    async fn start_node(
        &self,
        country: &str,
        server: Option<&str>,
    ) -> Result<Node, ControlError> {
        let mut request =
            self.request(reqwest::Method::POST, &format!("/api/nodes/{}/start", country));
        if let Some(server) = server {
            request = request.json(&StartNodeRequest {
                server: server.to_string(),
            });
        }
        self.send(request).await
    }

    async fn stop_node(&self, node_id: &str) -> Result<StatusResponse, ControlError> {
        self.send(self.request(
            reqwest::Method::DELETE,
            &format!("/api/nodes/{}/stop", node_id),
        ))
        .await
    }

    async fn restart_node(&self, node_id: &str) -> Result<StatusResponse, ControlError> {
        self.send(self.request(
            reqwest::Method::POST,
            &format!("/api/nodes/{}/restart", node_id),
        ))
        .await
    }

    async fn node_details(&self, node_id: &str) -> Result<Node, ControlError> {
        self.get(&format!("/api/nodes/{}", node_id)).await
    }

    async fn node_logs(&self, node_id: &str, lines: u32) -> Result<NodeLogs, ControlError> {
        self.send(
            self.request(reqwest::Method::GET, &format!("/api/nodes/{}/logs", node_id))
                .query(&[("lines", lines.to_string())]),
        )
        .await
    }

    async fn available_countries(&self) -> Result<Vec<String>, ControlError> {
        self.get("/api/countries").await
    }

    async fn run_speed_test(&self, node_id: &str) -> Result<SpeedTestResult, ControlError> {
        self.send(self.request(
            reqwest::Method::POST,
            &format!("/api/speed-test/{}", node_id),
        ))
        .await
    }
}

fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim();
    trimmed.strip_suffix('/').unwrap_or(trimmed).to_string()
}

fn basic_auth_header(username: &str, password: &str) -> String {
    format!(
        "Basic {}",
        STANDARD.encode(format!("{}:{}", username, password))
    )
}

/// Prefers `{detail}`, then the raw body, then the status line.
fn normalize_error(status: StatusCode, body: &str) -> ControlError {
    let detail = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.detail)
        .filter(|detail| !detail.is_empty());
    let message = match detail {
        Some(detail) => detail,
        None if !body.trim().is_empty() => body.to_string(),
        None => status
            .canonical_reason()
            .map(str::to_string)
            .unwrap_or_else(|| status.to_string()),
    };
    ControlError::Api {
        status: status.as_u16(),
        message,
    }
}

/// Accepts only the end-entity certificate whose SHA-256 digest equals the configured pin,
/// and only if it also passes regular webpki validation.
#[derive(Debug)]
struct PinnedServerCertVerifier {
    webpki: Arc<WebPkiServerVerifier>,
    expected_sha256: Vec<u8>,
}

impl PinnedServerCertVerifier {
    fn new(expected_sha256: Vec<u8>, roots: Arc<RootCertStore>) -> Result<Self> {
        let webpki = WebPkiServerVerifier::builder(roots)
            .build()
            .map_err(|err| anyhow!("failed to build tls verifier: {}", err))?;
        Ok(Self {
            webpki,
            expected_sha256,
        })
    }

    fn check_pin(&self, end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        let digest = Sha256::digest(end_entity.as_ref());
        if digest.as_slice() == self.expected_sha256.as_slice() {
            Ok(())
        } else {
            Err(rustls::Error::General("tls pin mismatch".to_string()))
        }
    }
}

impl ServerCertVerifier for PinnedServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.check_pin(end_entity)?;
        self.webpki
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.webpki.supported_verify_schemes()
    }
}

fn default_roots() -> RootCertStore {
    RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    }
}

fn build_http_client(tls_pin: Option<String>, timeout: Duration) -> Result<reqwest::Client> {
    let builder = reqwest::Client::builder().timeout(timeout);
    let Some(pin) = tls_pin else {
        return Ok(builder.build()?);
    };
    let roots = default_roots();
    let verifier = PinnedServerCertVerifier::new(decode_pin(&pin)?, Arc::new(roots.clone()))?;
    let mut tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tls.dangerous().set_certificate_verifier(Arc::new(verifier));
    Ok(builder.use_preconfigured_tls(tls).build()?)
}

fn decode_pin(pin: &str) -> Result<Vec<u8>> {
    let normalized: String = pin
        .chars()
        .filter(|ch| !ch.is_whitespace() && *ch != ':')
        .collect();
    let bytes = hex::decode(normalized).map_err(|_| anyhow!("invalid tls pin hex"))?;
    if bytes.len() != 32 {
        return Err(anyhow!("tls pin must be 32 bytes (sha256)"));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serves one canned HTTP response and hands back the raw request it received.
    async fn serve_once(status: &str, body: &str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let request = read_request(&mut stream).await;
            stream
                .write_all(response.as_bytes())
                .await
                .expect("write response");
            let _ = stream.shutdown().await;
            request
        });
        (format!("http://{}/", addr), handle)
    }

    async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.expect("read request");
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data).to_string();
            if let Some(head_end) = text.find("\r\n\r\n") {
                let content_length = text[..head_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        if name.eq_ignore_ascii_case("content-length") {
                            value.trim().parse::<usize>().ok()
                        } else {
                            None
                        }
                    })
                    .unwrap_or(0);
                if data.len() >= head_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&data).to_string()
    }

    fn client(url: &str) -> ControlClient {
        ControlClient::new(ControlSettings {
            api_url: url.to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            tls_pin: None,
            timeout: Duration::from_secs(5),
        })
        .expect("client")
    }

    #[test]
    fn base_url_trailing_slash_is_stripped_once() {
        assert_eq!(normalize_base_url("https://vpn.example/"), "https://vpn.example");
        assert_eq!(normalize_base_url(" https://vpn.example "), "https://vpn.example");
        assert!(ControlClient::new(ControlSettings {
            api_url: "  ".to_string(),
            username: String::new(),
            password: String::new(),
            tls_pin: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
        .is_err());
    }

    #[test]
    fn basic_auth_is_base64_of_credentials() {
        assert_eq!(
            basic_auth_header("admin", "secret"),
            "Basic YWRtaW46c2VjcmV0"
        );
    }

    #[test]
    fn error_prefers_detail_then_text_then_status_line() {
        let err = normalize_error(StatusCode::NOT_FOUND, r#"{"detail":"Node not found"}"#);
        assert_eq!(err.to_string(), "API Error (404): Node not found");

        let err = normalize_error(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert_eq!(err.to_string(), "API Error (500): boom");

        let err = normalize_error(StatusCode::BAD_REQUEST, r#"{"other":1}"#);
        assert_eq!(err.to_string(), r#"API Error (400): {"other":1}"#);

        let err = normalize_error(StatusCode::BAD_GATEWAY, "");
        assert_eq!(err.to_string(), "API Error (502): Bad Gateway");
    }

    #[test]
    fn decode_pin_accepts_colon_separated_hex() {
        let pin = vec!["ab"; 32].join(":");
        assert_eq!(decode_pin(&pin).unwrap(), vec![0xab; 32]);
        assert!(decode_pin("abcd").is_err());
        assert!(decode_pin("zz").is_err());
    }

    #[test]
    fn pinned_verifier_rejects_certificate_with_other_digest() {
        let cert = CertificateDer::from(vec![0x30, 0x03, 0x02, 0x01, 0x05]);
        let name = ServerName::try_from("vpn.example").unwrap();
        let verifier =
            PinnedServerCertVerifier::new(vec![0u8; 32], Arc::new(default_roots())).unwrap();
        let err = verifier
            .verify_server_cert(&cert, &[], &name, &[], UnixTime::now())
            .unwrap_err();
        assert_eq!(err, rustls::Error::General("tls pin mismatch".to_string()));
    }

    #[test]
    fn pinned_verifier_still_requires_a_valid_chain() {
        let cert = CertificateDer::from(vec![0x30, 0x03, 0x02, 0x01, 0x05]);
        let name = ServerName::try_from("vpn.example").unwrap();
        let pin = Sha256::digest(cert.as_ref()).to_vec();
        let verifier = PinnedServerCertVerifier::new(pin, Arc::new(default_roots())).unwrap();
        assert!(verifier.check_pin(&cert).is_ok());
        let err = verifier
            .verify_server_cert(&cert, &[], &name, &[], UnixTime::now())
            .unwrap_err();
        assert_ne!(err, rustls::Error::General("tls pin mismatch".to_string()));
    }

    #[test]
    fn pinned_client_builds() {
        let pin = vec!["0f"; 32].join(":");
        assert!(build_http_client(Some(pin), DEFAULT_REQUEST_TIMEOUT).is_ok());
        assert!(build_http_client(Some("nothex".to_string()), DEFAULT_REQUEST_TIMEOUT).is_err());
    }

    #[tokio::test]
    async fn list_nodes_sends_credentials() {
        let (url, server) = serve_once(
            "200 OK",
            r#"[{"id":"vpn-us","country":"us","status":"running"}]"#,
        )
        .await;
        let nodes = client(&url).list_nodes().await.expect("list nodes");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "vpn-us");

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/nodes HTTP/1.1"));
        assert!(request
            .to_lowercase()
            .contains("authorization: basic ywrtaw46c2vjcmv0"));
    }

    #[tokio::test]
    async fn stop_failure_carries_status_and_detail() {
        let (url, server) = serve_once("404 Not Found", r#"{"detail":"Node not found"}"#).await;
        let err = client(&url).stop_node("abc").await.unwrap_err();
        assert_eq!(
            err,
            ControlError::Api {
                status: 404,
                message: "Node not found".to_string()
            }
        );
        let request = server.await.unwrap();
        assert!(request.starts_with("DELETE /api/nodes/abc/stop HTTP/1.1"));
    }

    #[tokio::test]
    async fn start_without_server_sends_no_body() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"id":"vpn-de","country":"de","status":"starting"}"#,
        )
        .await;
        let node = client(&url).start_node("de", None).await.unwrap();
        assert_eq!(node.country, "de");
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/nodes/de/start HTTP/1.1"));
        assert!(!request.contains("\"server\""));
    }

    #[tokio::test]
    async fn start_with_server_sends_server_field() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"id":"vpn-de","country":"de","status":"starting","vpn_server":"de1"}"#,
        )
        .await;
        client(&url).start_node("de", Some("de1")).await.unwrap();
        let request = server.await.unwrap();
        assert!(request.ends_with(r#"{"server":"de1"}"#));
    }

    #[tokio::test]
    async fn logs_pass_line_count() {
        let (url, server) = serve_once("200 OK", r#"{"logs":"a\nb","lines":2}"#).await;
        let logs = client(&url).node_logs("n1", 50).await.unwrap();
        assert_eq!(logs.lines, 2);
        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/nodes/n1/logs?lines=50 HTTP/1.1"));
    }

    #[tokio::test]
    async fn malformed_success_body_is_decode_error() {
        let (url, _server) = serve_once("200 OK", r#"{"unexpected":true}"#).await;
        let err = client(&url).list_nodes().await.unwrap_err();
        assert!(matches!(err, ControlError::Decode(_)));
    }

    #[tokio::test]
    async fn unreachable_control_plane_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = client(&format!("http://{}", addr))
            .list_nodes()
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Transport(_)));
    }
}
