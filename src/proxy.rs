//! The intercepting proxy listener: dispatches `CONNECT` tunnels through
//! the MITM TLS bridge and everything else through the clear-text path,
//! capturing both legs of each exchange as it goes.

use crate::ca::CertificateAuthority;
use crate::config::ServerConfig as ListenerConfig;
use crate::db::CaptureStore;
use crate::error::{ProxyError, ProxyResult};
use crate::middleware::{catch_panic, log_access, RequestIdGenerator};
use crate::tls as proxy_tls;
use crate::wire::{self, ParsedRequest};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::pki_types::ServerName;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn};

const OK_HEADER: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Await `fut`, mapping a timeout into the same `io::ErrorKind::TimedOut`
/// shape a real read/write failure would produce.
async fn with_timeout<T>(timeout: Duration, fut: impl std::future::Future<Output = ProxyResult<T>>) -> ProxyResult<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::Io(io::Error::new(io::ErrorKind::TimedOut, "timed out"))),
    }
}

/// Status/body pair written to the client when a clear-text transaction
/// fails: upstream/transport problems surface as 503, storage/internal
/// problems as 500, both carrying the fixed `"internal server error"` text.
fn transaction_status(err: &ProxyError) -> u16 {
    match err {
        ProxyError::UpstreamConnection { .. } | ProxyError::ClientTls(_) | ProxyError::UpstreamTls { .. } | ProxyError::Http(_) => 503,
        _ => 500,
    }
}

async fn write_status_response<W>(wr: &mut W, status: u16, body: &str)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let reason = match status {
        503 => "Service Unavailable",
        500 => "Internal Server Error",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = wr.write_all(response.as_bytes()).await;
}

pub struct ProxyServer {
    listener_config: ListenerConfig,
    ca: Arc<CertificateAuthority>,
    store: CaptureStore,
    request_ids: Arc<RequestIdGenerator>,
    http_client: Client<HttpConnector, Full<Bytes>>,
}

impl ProxyServer {
    pub fn new(listener_config: ListenerConfig, ca: Arc<CertificateAuthority>, store: CaptureStore) -> Self {
        Self {
            listener_config,
            ca,
            store,
            request_ids: Arc::new(RequestIdGenerator::new()),
            http_client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        }
    }

    pub async fn run(self: Arc<Self>) -> ProxyResult<()> {
        let addr = self.listener_config.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ProxyError::BindFailed {
                port: self.listener_config.port,
                reason: e.to_string(),
            })?;
        info!(%addr, "proxy listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                let log_id = this.request_ids.next_id();
                match catch_panic(log_id, this.handle_connection(log_id, stream, peer)).await {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        if e.is_recoverable() {
                            debug!(%peer, error = %e, "connection ended");
                        } else {
                            error!(%peer, error = %e, "connection failed");
                        }
                    }
                    None => {}
                }
            });
        }
    }

    async fn handle_connection(&self, log_id: u64, stream: TcpStream, peer: SocketAddr) -> ProxyResult<()> {
        let read_timeout = Duration::from_secs(self.listener_config.read_timeout);
        let (rd, wr) = tokio::io::split(stream);
        let mut reader = BufReader::new(rd);
        let mut wr = wr;

        let Some((_raw, parsed)) = with_timeout(read_timeout, async { wire::read_request(&mut reader).await }).await? else {
            return Ok(());
        };

        if parsed.method.eq_ignore_ascii_case("CONNECT") {
            self.handle_connect(log_id, parsed, reader, wr, peer).await
        } else {
            self.handle_plain(log_id, parsed, &mut wr, peer).await
        }
    }

    async fn handle_connect<R, W>(&self, log_id: u64, parsed: ParsedRequest, reader: BufReader<R>, mut wr: W, peer: SocketAddr) -> ProxyResult<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let started = Instant::now();
        let read_timeout = Duration::from_secs(self.listener_config.read_timeout);
        let write_timeout = Duration::from_secs(self.listener_config.write_timeout);

        let host = match parsed.target.rsplit_once(':') {
            Some((h, _port)) if !h.is_empty() => h.to_string(),
            _ => {
                warn!(request_id = log_id, host = %parsed.target, "cannot determine cert name");
                write_status_response(&mut wr, 503, "no upstream").await;
                return Err(ProxyError::NoUpstream);
            }
        };

        with_timeout(write_timeout, async { Ok(wr.write_all(OK_HEADER).await?) }).await?;
        let client_stream = tokio::io::join(reader.into_inner(), wr);

        let leaf = self.ca.mint_leaf(&host)?;
        let server_config = proxy_tls::server_config_for_leaf(leaf)?;
        let acceptor = TlsAcceptor::from(Arc::new(server_config));
        let tls_stream = acceptor
            .accept(client_stream)
            .await
            .map_err(|e| ProxyError::ClientTls(e.to_string()))?;

        // Past this point the client side is a live TLS session: any
        // failure closes the tunnel silently, since there is no plaintext
        // channel left to carry an HTTP error response.
        let (client_rd, mut client_wr) = tokio::io::split(tls_stream);
        let mut client_reader = BufReader::new(client_rd);

        let Some((raw_req, req)) =
            with_timeout(read_timeout, async { wire::read_request(&mut client_reader).await }).await?
        else {
            return Ok(());
        };

        let captured_request = wire::build_captured_request(&req, &raw_req, true);
        let request_id = self.store.insert_request(&captured_request).await?;

        let connector = TlsConnector::from(Arc::new(proxy_tls::insecure_client_config()));
        let upstream_tcp = TcpStream::connect(&parsed.target)
            .await
            .map_err(|e| ProxyError::UpstreamConnection {
                target: parsed.target.clone(),
                reason: e.to_string(),
            })?;
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| ProxyError::Certificate(format!("invalid server name: {host}")))?;
        let mut upstream_tls = connector
            .connect(server_name, upstream_tcp)
            .await
            .map_err(|e| ProxyError::UpstreamTls {
                target: parsed.target.clone(),
                reason: e.to_string(),
            })?;

        upstream_tls.write_all(&raw_req).await?;

        let mut upstream_reader = BufReader::new(upstream_tls);
        let (raw_resp, resp) = wire::read_response(&mut upstream_reader).await?;

        with_timeout(write_timeout, async { Ok(client_wr.write_all(&raw_resp).await?) }).await?;

        let captured_response = wire::build_captured_response(&resp, &raw_resp, true);
        self.store.insert_response(request_id, &captured_response).await?;

        log_access(log_id, &req.method, &peer.to_string(), &host, &req.target, started.elapsed());
        Ok(())
    }

    async fn handle_plain<W>(&self, log_id: u64, mut parsed: ParsedRequest, wr: &mut W, peer: SocketAddr) -> ProxyResult<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let started = Instant::now();
        let write_timeout = Duration::from_secs(self.listener_config.write_timeout);

        // Strip before computing `raw` so the persisted/replayable capture
        // never carries a header the upstream never actually received.
        parsed.headers.retain(|(name, _)| !name.eq_ignore_ascii_case("proxy-connection"));
        let raw = wire::render_request(&parsed);

        let host = parsed
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("host"))
            .map(|(_, v)| v.clone())
            .unwrap_or_default();

        match self.handle_plain_inner(&parsed, &raw, &host, wr, write_timeout).await {
            Ok((request_id, captured_response)) => {
                log_access(log_id, &parsed.method, &peer.to_string(), &host, &parsed.target, started.elapsed());
                if let Err(e) = self.store.insert_response(request_id, &captured_response).await {
                    warn!(request_id, error = %e, "failed to persist response after it was streamed to the client");
                }
                Ok(())
            }
            Err(HandlePlainError::BeforeResponse(e)) => {
                write_status_response(wr, transaction_status(&e), "internal server error").await;
                Err(e)
            }
            Err(HandlePlainError::AfterResponse(e)) => {
                // Bytes have already gone to the client; per the accepted
                // truncated-partial-response policy, don't try to layer
                // another HTTP response on top.
                Err(e)
            }
        }
    }
}

enum HandlePlainError {
    BeforeResponse(ProxyError),
    AfterResponse(ProxyError),
}

impl ProxyServer {
    async fn handle_plain_inner<W>(
        &self,
        parsed: &ParsedRequest,
        raw: &Bytes,
        host: &str,
        wr: &mut W,
        write_timeout: Duration,
    ) -> Result<(i64, crate::model::CapturedResponse), HandlePlainError>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let captured_request = wire::build_captured_request(parsed, raw, false);
        let request_id = self
            .store
            .insert_request(&captured_request)
            .await
            .map_err(HandlePlainError::BeforeResponse)?;

        let uri = if parsed.target.starts_with("http://") || parsed.target.starts_with("https://") {
            parsed.target.clone()
        } else {
            format!("http://{}{}", host, parsed.target)
        };

        let method: http::Method = parsed
            .method
            .parse()
            .map_err(|_| HandlePlainError::BeforeResponse(ProxyError::Http(format!("invalid method: {}", parsed.method))))?;

        let mut builder = http::Request::builder().method(method).uri(&uri);
        for (name, value) in &parsed.headers {
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            builder = builder.header(name, value);
        }
        let request = builder
            .body(Full::new(parsed.body.clone()))
            .map_err(|e| HandlePlainError::BeforeResponse(ProxyError::Http(e.to_string())))?;

        let response = self
            .http_client
            .request(request)
            .await
            .map_err(|e| {
                HandlePlainError::BeforeResponse(ProxyError::UpstreamConnection {
                    target: uri.clone(),
                    reason: e.to_string(),
                })
            })?;

        let (parts, body) = response.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| HandlePlainError::BeforeResponse(ProxyError::Http(e.to_string())))?
            .to_bytes();

        let raw_resp = wire::render_response(&parts, &body_bytes);
        with_timeout(write_timeout, async { Ok(wr.write_all(&raw_resp).await?) })
            .await
            .map_err(HandlePlainError::AfterResponse)?;

        let captured_response = wire::captured_response_from_parts(&parts, &body_bytes, &raw_resp, false);
        Ok((request_id, captured_response))
    }
}
