//! The replay API: lists captured requests and can resend any of them,
//! either by dialing the original host directly (for an HTTPS capture) or
//! by routing the reconstructed request through an ordinary HTTP client.

use crate::config::ServerConfig as ListenerConfig;
use crate::db::CaptureStore;
use crate::error::{ProxyError, ProxyResult};
use crate::middleware::{catch_panic, log_access, RequestIdGenerator};
use crate::model::RequestRecord;
use crate::tls as proxy_tls;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsConnector;
use tracing::{error, info, warn};

pub struct ReplayServer {
    listener_config: ListenerConfig,
    store: CaptureStore,
    request_ids: Arc<RequestIdGenerator>,
    http_client: Client<HttpConnector, Full<Bytes>>,
}

impl ReplayServer {
    pub fn new(listener_config: ListenerConfig, store: CaptureStore) -> Self {
        Self {
            listener_config,
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
        info!(%addr, "replay api listening");

        let connection_timeout =
            Duration::from_secs(self.listener_config.read_timeout + self.listener_config.write_timeout);

        loop {
            let (stream, peer) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let this = this.clone();
                    async move { Ok::<_, std::convert::Infallible>(this.handle_request(req, peer).await) }
                });
                let serve = AutoBuilder::new(TokioExecutor::new()).serve_connection(io, service);
                match tokio::time::timeout(connection_timeout, serve).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(%peer, error = %e, "replay connection error"),
                    Err(_) => warn!(%peer, "replay connection timed out"),
                }
            });
        }
    }

    /// Assigns the request id and emits the access-log line around
    /// dispatch, the same way the proxy listener does for each connection.
    async fn handle_request(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<Full<Bytes>> {
        let log_id = self.request_ids.next_id();
        let started = Instant::now();
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let response = match catch_panic(log_id, self.route(req, peer)).await {
            Some(response) => response,
            None => error_response(&ProxyError::Internal("panic recovered".into())),
        };

        log_access(log_id, &method, &peer.to_string(), &host, &path, started.elapsed());
        response
    }

    async fn route(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<Full<Bytes>> {
        let path = req.uri().path().to_string();
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

        let result = match (req.method(), segments.as_slice()) {
            (&hyper::Method::GET, ["requests"]) => self.handle_all_requests().await,
            (&hyper::Method::GET, ["requests", id]) => self.handle_request_by_id(id).await,
            (&hyper::Method::GET, ["repeat", id]) => self.handle_repeat(id).await,
            _ => Err(ProxyError::Http("not found".into())),
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                if !e.is_recoverable() {
                    error!(%peer, error = %e, "replay request failed");
                }
                error_response(&e)
            }
        }
    }

    async fn handle_all_requests(&self) -> ProxyResult<Response<Full<Bytes>>> {
        let requests = self.store.get_all_requests().await?;
        json_response(StatusCode::OK, &requests)
    }

    async fn handle_request_by_id(&self, raw_id: &str) -> ProxyResult<Response<Full<Bytes>>> {
        let id = parse_request_id(raw_id)?;
        let record = self
            .store
            .get_request_by_id(id)
            .await?
            .ok_or(ProxyError::Absent)?;
        json_response(StatusCode::OK, &record)
    }

    /// Reconstruct a captured request from its raw bytes and resend it to
    /// the original host. HTTPS captures are dialed and written verbatim,
    /// byte for byte, the way the original capture was taken; plaintext
    /// captures are sent through a normal HTTP client.
    async fn handle_repeat(&self, raw_id: &str) -> ProxyResult<Response<Full<Bytes>>> {
        let id = parse_request_id(raw_id)?;
        let record = self
            .store
            .get_request_by_id(id)
            .await?
            .ok_or(ProxyError::Absent)?;

        let host = record
            .request
            .headers
            .get("Host")
            .and_then(|v| v.first())
            .map(str::to_string)
            .ok_or(ProxyError::NoUpstream)?;

        if record.request.is_https {
            self.repeat_https(&record, &host).await
        } else {
            self.repeat_plain(&record, &host).await
        }
    }

    async fn repeat_https(&self, record: &RequestRecord, host: &str) -> ProxyResult<Response<Full<Bytes>>> {
        let target = format!("{host}:443");
        let connector = TlsConnector::from(Arc::new(proxy_tls::insecure_client_config()));
        let tcp = tokio::net::TcpStream::connect(&target)
            .await
            .map_err(|e| ProxyError::UpstreamConnection {
                target: target.clone(),
                reason: e.to_string(),
            })?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ProxyError::Certificate(format!("invalid server name: {host}")))?;
        let mut tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::UpstreamTls {
                target: target.clone(),
                reason: e.to_string(),
            })?;

        tls.write_all(record.request.raw.as_bytes()).await?;

        let mut reader = BufReader::new(tls);
        let (_raw, resp) = crate::wire::read_response(&mut reader).await?;

        Ok(Response::builder()
            .status(resp.status)
            .body(Full::new(Bytes::from(resp.body.to_vec())))
            .map_err(|e| ProxyError::Http(e.to_string()))?)
    }

    async fn repeat_plain(&self, record: &RequestRecord, host: &str) -> ProxyResult<Response<Full<Bytes>>> {
        let mut reader = BufReader::new(std::io::Cursor::new(record.request.raw.as_bytes().to_vec()));
        let (_raw, parsed) = crate::wire::read_request(&mut reader)
            .await?
            .ok_or_else(|| ProxyError::Http("empty raw request".into()))?;

        let uri = format!("http://{host}{}", parsed.target);
        let method: http::Method = parsed
            .method
            .parse()
            .map_err(|_| ProxyError::Http(format!("invalid method: {}", parsed.method)))?;

        let mut builder = http::Request::builder().method(method).uri(&uri);
        for (name, value) in &parsed.headers {
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            builder = builder.header(name, value);
        }
        let request = builder
            .body(Full::new(parsed.body))
            .map_err(|e| ProxyError::Http(e.to_string()))?;

        let response = self
            .http_client
            .request(request)
            .await
            .map_err(|e| ProxyError::UpstreamConnection {
                target: uri,
                reason: e.to_string(),
            })?;

        let (parts, body) = response.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| ProxyError::Http(e.to_string()))?
            .to_bytes();

        Ok(Response::from_parts(parts, Full::new(body_bytes)))
    }
}

fn parse_request_id(raw: &str) -> ProxyResult<i64> {
    let id: i64 = raw.parse().map_err(|_| ProxyError::BadRequestId)?;
    if id < 0 {
        return Err(ProxyError::BadRequestId);
    }
    Ok(id)
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> ProxyResult<Response<Full<Bytes>>> {
    let body = serde_json::to_vec(value).map_err(|e| ProxyError::Internal(e.to_string()))?;
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| ProxyError::Http(e.to_string()))
}

fn error_response(err: &ProxyError) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(err.status_code() as u16).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({ "error": err.client_message() });
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}
