//! Authenticated websocket dial to the API server
//!
//! The raw-relay path opens its own websocket to the pod's `exec`
//! sub-resource. The handshake request is passed through the same auth layer
//! kube-rs puts in front of ordinary API calls (bearer tokens, basic auth,
//! exec plugins, token refresh), so the dial carries exactly the credentials
//! the kubeconfig grants.
//!
//! ```text
//! connect(url)
//!   https -> wss, http -> ws
//!   Request --> [auth layer] --> WebsocketDialer
//!                                 reqwest HTTP/1.1 upgrade (proxy, TLS)
//!                                 raw socket --> websocket client
//! ```

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::header::{
    CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::uri::Scheme;
use http::{HeaderValue, Request, Response, StatusCode, Uri};
use kube::client::{Body, ConfigExt};
use reqwest::{NoProxy, Proxy};
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::WebSocketStream;
use tower::util::BoxCloneSyncService;
use tower::{BoxError, Service, ServiceBuilder, ServiceExt};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::frame::{Frame, FrameSocket};

/// Subprotocol requested when the caller names none
pub const DEFAULT_SUBPROTOCOL: &str = "base64.channel.k8s.io";

/// Stdin channel of the kubelet's channel protocols
const STDIN_CHANNEL: u8 = 0;

/// Instruction sent to the shell when the relay is torn down
const EXIT_COMMAND: &[u8] = b"exit\r\n";

/// Backend handshake timeout
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Raw websocket stream to the API server
pub type BackendStream = WebSocketStream<reqwest::Upgraded>;

/// Backend websocket exposed as frames
pub type BackendSocket = FrameSocket<BackendStream, TungsteniteMessage>;

/// Upgrader tuning
#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    /// Time allowed for proxy, TLS and websocket handshakes together
    pub handshake_timeout: Duration,
    /// Hosts that bypass the kubeconfig's `proxy-url`, in `NO_PROXY` syntax
    /// (domains, IPs and CIDR blocks). `None` reads `NO_PROXY` from the
    /// environment.
    pub no_proxy: Option<String>,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            no_proxy: None,
        }
    }
}

/// An established backend websocket
pub struct BackendConnection {
    /// The websocket
    pub socket: BackendSocket,
    /// Subprotocol the API server selected
    pub subprotocol: Option<String>,
}

impl BackendConnection {
    /// Frame telling the remote shell to exit, encoded for the negotiated
    /// subprotocol
    pub fn exit_frame(&self) -> Frame {
        exit_frame(self.subprotocol.as_deref())
    }
}

/// `exit\r\n` on the stdin channel
///
/// Base64 channel protocols carry it as text, `'0'` followed by the base64
/// payload; binary channel protocols as the channel byte followed by the raw
/// bytes.
pub fn exit_frame(subprotocol: Option<&str>) -> Frame {
    if is_base64_protocol(subprotocol) {
        Frame::Text(format!(
            "{}{}",
            char::from(b'0' + STDIN_CHANNEL),
            STANDARD.encode(EXIT_COMMAND)
        ))
    } else {
        let mut data = Vec::with_capacity(EXIT_COMMAND.len() + 1);
        data.push(STDIN_CHANNEL);
        data.extend_from_slice(EXIT_COMMAND);
        Frame::Binary(Bytes::from(data))
    }
}

fn is_base64_protocol(subprotocol: Option<&str>) -> bool {
    subprotocol
        .map(|p| p.ends_with(DEFAULT_SUBPROTOCOL))
        .unwrap_or(false)
}

type DialService = BoxCloneSyncService<Request<Body>, Response<BackendStream>, BoxError>;

/// Opens authenticated websockets to the API server
#[derive(Clone)]
pub struct Upgrader {
    service: DialService,
    options: UpgradeOptions,
}

impl Upgrader {
    /// Build an upgrader from a kube client configuration
    pub fn from_config(config: &kube::Config) -> Result<Self> {
        Self::with_options(config, UpgradeOptions::default())
    }

    /// Build an upgrader with explicit options
    pub fn with_options(config: &kube::Config, options: UpgradeOptions) -> Result<Self> {
        let client = upgrade_client(config, &options)?;

        let auth = config
            .auth_layer()
            .map_err(|e| Error::config(format!("kubeconfig auth: {}", e)))?;

        let service = ServiceBuilder::new()
            .option_layer(auth)
            .service(WebsocketDialer { client });

        Ok(Self {
            service: BoxCloneSyncService::new(service),
            options,
        })
    }

    /// Open a websocket to `url`, offering `subprotocols` in order
    ///
    /// Offers [`DEFAULT_SUBPROTOCOL`] when `subprotocols` is empty.
    pub async fn connect(&self, url: &Uri, subprotocols: &[String]) -> Result<BackendConnection> {
        let url = websocket_uri(url)?;
        let offered = if subprotocols.is_empty() {
            DEFAULT_SUBPROTOCOL.to_string()
        } else {
            subprotocols.join(", ")
        };

        let request = Request::get(url.clone())
            .header(
                SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_str(&offered)
                    .map_err(|e| Error::config(format!("invalid subprotocol: {}", e)))?,
            )
            .body(Body::from(Vec::new()))
            .map_err(|e| Error::config(e.to_string()))?;

        debug!(path = url.path(), protocols = %offered, "dialing backend websocket");
        let dial = self.service.clone().oneshot(request);
        let response = tokio::time::timeout(self.options.handshake_timeout, dial)
            .await
            .map_err(|_| {
                Error::transport(
                    "backend",
                    format!(
                        "websocket handshake timed out after {:?}",
                        self.options.handshake_timeout
                    ),
                )
            })?
            .map_err(dial_error)?;

        let subprotocol = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        info!(subprotocol = ?subprotocol, "backend websocket established");

        Ok(BackendConnection {
            socket: FrameSocket::new(response.into_body()),
            subprotocol,
        })
    }
}

/// HTTP/1.1 client for the upgrade request
///
/// TLS comes from the kubeconfig. The proxy is the kubeconfig's `proxy-url`
/// when set, otherwise reqwest's own `HTTPS_PROXY`/`HTTP_PROXY`/`NO_PROXY`
/// handling. Loopback clusters are always dialed directly.
fn upgrade_client(config: &kube::Config, options: &UpgradeOptions) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().http1_only();

    if config.cluster_url.scheme() == Some(&Scheme::HTTPS) {
        let mut tls = config
            .rustls_client_config()
            .map_err(|e| Error::transport("tls", e.to_string()))?;
        // The websocket handshake is HTTP/1.1 only
        tls.alpn_protocols.clear();
        builder = builder.use_preconfigured_tls(tls);
    }

    builder = match &config.proxy_url {
        _ if is_loopback(&config.cluster_url) => builder.no_proxy(),
        Some(proxy_url) => {
            let no_proxy = match &options.no_proxy {
                Some(list) => NoProxy::from_string(list),
                None => NoProxy::from_env(),
            };
            let proxy = Proxy::all(proxy_url.to_string())
                .map_err(|e| Error::config(format!("invalid proxy-url: {}", e)))?
                .no_proxy(no_proxy);
            builder.proxy(proxy)
        }
        None => builder,
    };

    builder
        .build()
        .map_err(|e| Error::config(format!("failed to build upgrade client: {}", e)))
}

fn is_loopback(url: &Uri) -> bool {
    match url.host() {
        Some("localhost") => true,
        Some(host) => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false),
        None => false,
    }
}

/// Rewrite an API server URL to its websocket scheme
fn websocket_uri(url: &Uri) -> Result<Uri> {
    let scheme = match url.scheme_str() {
        Some("https") | Some("wss") => "wss",
        Some("http") | Some("ws") => "ws",
        other => {
            return Err(Error::config(format!(
                "unsupported URL scheme {:?} in {}",
                other, url
            )))
        }
    };
    let authority = url
        .authority()
        .ok_or_else(|| Error::config(format!("URL has no host: {}", url)))?;

    Uri::builder()
        .scheme(scheme)
        .authority(authority.clone())
        .path_and_query(url.path_and_query().map(|pq| pq.as_str()).unwrap_or("/"))
        .build()
        .map_err(|e| Error::config(e.to_string()))
}

/// The `http(s)` URL the upgrade request is actually sent to
fn transport_url(url: &Uri) -> Result<String> {
    let scheme = match url.scheme_str() {
        Some("wss") | Some("https") => "https",
        Some("ws") | Some("http") => "http",
        other => {
            return Err(Error::config(format!(
                "unsupported URL scheme {:?} in {}",
                other, url
            )))
        }
    };
    let authority = url
        .authority()
        .ok_or_else(|| Error::config(format!("URL has no host: {}", url)))?;
    let path = url.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    Ok(format!("{}://{}{}", scheme, authority, path))
}

fn dial_error(err: BoxError) -> Error {
    match err.downcast::<Error>() {
        Ok(err) => *err,
        Err(err) => Error::transport("backend", err.to_string()),
    }
}

/// Innermost service of the dial stack: sends the upgrade request with
/// whatever headers the auth layer attached and wraps the upgraded
/// connection as a websocket
#[derive(Clone)]
struct WebsocketDialer {
    client: reqwest::Client,
}

impl Service<Request<Body>> for WebsocketDialer {
    type Response = Response<BackendStream>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), BoxError>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let dialer = self.clone();
        Box::pin(async move { dialer.dial(request).await.map_err(BoxError::from) })
    }
}

impl WebsocketDialer {
    async fn dial(self, request: Request<Body>) -> Result<Response<BackendStream>> {
        let (parts, _body) = request.into_parts();
        let url = transport_url(&parts.uri)?;
        let key = generate_key();

        let response = self
            .client
            .request(parts.method, &url)
            .headers(parts.headers)
            .header(UPGRADE, "websocket")
            .header(CONNECTION, "Upgrade")
            .header(SEC_WEBSOCKET_VERSION, "13")
            .header(SEC_WEBSOCKET_KEY, key.as_str())
            .send()
            .await
            .map_err(|e| Error::transport("backend", format!("upgrade request failed: {}", e)))?;

        let status = response.status();
        if status != StatusCode::SWITCHING_PROTOCOLS {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(Error::transport(
                "backend",
                format!("API server returned {} instead of 101: {}", status, body.trim()),
            ));
        }

        let expected = derive_accept_key(key.as_bytes());
        let accept = response.headers().get(SEC_WEBSOCKET_ACCEPT);
        if accept.map(HeaderValue::as_bytes) != Some(expected.as_bytes()) {
            return Err(Error::transport(
                "backend",
                "upgrade response carries a wrong Sec-WebSocket-Accept",
            ));
        }

        let headers = response.headers().clone();
        let upgraded = response
            .upgrade()
            .await
            .map_err(|e| Error::transport("backend", format!("upgrade failed: {}", e)))?;
        let socket = WebSocketStream::from_raw_socket(upgraded, Role::Client, None).await;

        let mut response = Response::new(socket);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}
