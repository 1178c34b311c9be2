// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text;charset=utf-8;version=1.0.0";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Server exposes the registry at `/metrics`.
pub struct Server {
    listener: TcpListener,
    addr: SocketAddr,
    registry: Arc<Registry>,
}

impl Server {
    pub async fn bind(addr: SocketAddr, registry: Registry) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        Ok(Server {
            listener,
            addr,
            registry: Arc::new(registry),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    /// Serves until `cancel` fires, then drains open connections.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let Server {
            listener,
            addr,
            registry,
        } = self;
        info!(address = %addr, component = "stats", "listener established");
        tokio::spawn(async move {
            let mut builder = http1::Builder::new();
            builder
                .timer(TokioTimer::new())
                .half_close(true)
                .header_read_timeout(Duration::from_secs(2))
                .max_buf_size(8 * 1024);
            let graceful = GracefulShutdown::new();
            loop {
                let stream = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = listener.accept() => match res {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            accept_failed(&e).await;
                            continue;
                        }
                    },
                };
                let registry = registry.clone();
                let service = service_fn(move |req| {
                    let registry = registry.clone();
                    async move { Ok::<_, Infallible>(handle(&registry, req)) }
                });
                let conn = graceful.watch(builder.serve_connection(TokioIo::new(stream), service));
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!("stats connection error: {e}");
                    }
                });
            }
            info!("starting drain of stats server");
            if tokio::time::timeout(DRAIN_TIMEOUT, graceful.shutdown())
                .await
                .is_err()
            {
                warn!("stats connections did not drain within {DRAIN_TIMEOUT:?}");
            }
            info!("stats server terminated");
        })
    }
}

// Accept errors such as EMFILE persist until a descriptor frees up.
async fn accept_failed(e: &io::Error) {
    warn!("stats accept failed: {e}");
    tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
}

fn handle(registry: &Registry, req: Request<Incoming>) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/metrics" => metrics(registry),
        _ => empty_response(StatusCode::NOT_FOUND),
    }
}

fn metrics(registry: &Registry) -> Response<Full<Bytes>> {
    let mut buf = String::new();
    if let Err(e) = encode(&mut buf, registry) {
        error!("failed to encode metrics: {e}");
        return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
    }
    let mut resp = Response::new(Full::new(Bytes::from(buf)));
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static(OPENMETRICS_CONTENT_TYPE),
    );
    resp
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::default());
    *resp.status_mut() = status;
    resp
}
