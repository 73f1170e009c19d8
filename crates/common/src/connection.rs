//! WebSocket connection establishment with auth headers, IPv4 preference and TLS.
//!
//! Only the handshake lives here. Callers split the returned stream and drive
//! the read and write halves from their own tasks.

use crate::error::{Error, Result};
use futures::stream::{SplitSink, SplitStream};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

/// A connected websocket, plain or TLS.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of a split [`WsStream`].
pub type WsSink = SplitSink<WsStream, Message>;

/// Read half of a split [`WsStream`].
pub type WsSource = SplitStream<WsStream>;

/// Parameters for a single connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    /// Extra handshake headers (e.g. `X-API-Key`).
    pub headers: Vec<(String, String)>,
    /// Per-address TCP connect timeout.
    pub connect_timeout: Duration,
    /// Label used in log lines.
    pub label: String,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: Vec::new(),
            connect_timeout: Duration::from_secs(5),
            label: "ws".to_string(),
        }
    }
}

/// Open a websocket to `config.url`, sending `config.headers` with the upgrade request.
pub async fn connect(config: &ConnectConfig) -> Result<WsStream> {
    let url = Url::parse(&config.url)?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::Generic("No host in URL".to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::Generic(format!("No port for scheme {}", url.scheme())))?;
    let addr_str = format!("{}:{}", host, port);

    // Prefer IPv4 to avoid IPv6 timeouts on hosts with broken v6 routes
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(addr_str.as_str())
        .await
        .map_err(|e| Error::Generic(format!("DNS resolution failed: {}", e)))?
        .collect();
    let mut sorted_addrs: Vec<SocketAddr> =
        addrs.iter().filter(|a| a.is_ipv4()).copied().collect();
    sorted_addrs.extend(addrs.iter().filter(|a| a.is_ipv6()).copied());

    debug!(
        "[{}] Resolved addresses (IPv4 first): {:?}",
        config.label, sorted_addrs
    );

    let mut tcp_stream = None;
    for addr in &sorted_addrs {
        match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                debug!("[{}] TCP connected to {}", config.label, addr);
                tcp_stream = Some(stream);
                break;
            }
            Ok(Err(e)) => {
                debug!("[{}] TCP connect to {} failed: {}", config.label, addr, e);
            }
            Err(_) => {
                debug!("[{}] TCP connect to {} timed out", config.label, addr);
            }
        }
    }
    let tcp_stream = tcp_stream
        .ok_or_else(|| Error::Generic("All connection attempts failed".to_string()))?;

    let mut request = config.url.as_str().into_client_request()?;
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::InvalidHeader(name.clone()))?;
        let value =
            HeaderValue::from_str(value).map_err(|_| Error::InvalidHeader(name.to_string()))?;
        request.headers_mut().insert(name, value);
    }

    let connector = if url.scheme() == "wss" {
        Some(tls_connector()?)
    } else {
        None
    };

    let (ws_stream, response) =
        client_async_tls_with_config(request, tcp_stream, None, connector).await?;

    debug!(
        "[{}] WebSocket handshake complete, status: {:?}",
        config.label,
        response.status()
    );

    Ok(ws_stream)
}

fn tls_connector() -> Result<Connector> {
    let mut root_store = rustls::RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        let _ = root_store.add(cert);
    }

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Generic(format!("TLS config error: {}", e)))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    Ok(Connector::Rustls(Arc::new(config)))
}

/// Whether a read error is an ordinary disconnect rather than a fault.
///
/// Some feeds close with non-standard close codes or drop the socket without
/// a closing handshake; both are routine and only worth a debug line.
pub fn is_benign_close(err: &WsError) -> bool {
    matches!(
        err,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)
            | WsError::Protocol(ProtocolError::InvalidCloseSequence)
    )
}
