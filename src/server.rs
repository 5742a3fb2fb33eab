//! Front HTTP server feeding requests into the dispatcher

use crate::dispatcher::ProxyDispatcher;
use crate::error::ProxyError;
use crate::request::InboundRequest;
use crate::response_assembler::{error_response, ProxyBody};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// HTTP/1 server in front of a [`ProxyDispatcher`]
pub struct ProxyServer {
    dispatcher: Arc<ProxyDispatcher>,
    default_scheme: String,
}

impl ProxyServer {
    pub fn new(dispatcher: Arc<ProxyDispatcher>) -> Self {
        Self {
            dispatcher,
            default_scheme: "http".to_string(),
        }
    }

    /// Scheme assumed for origin-form requests without `X-Forwarded-Proto`
    pub fn with_default_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.default_scheme = scheme.into();
        self
    }

    pub async fn start(self, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until an accept error occurs
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        info!("Proxy listening on http://{}", listener.local_addr()?);
        let server = Arc::new(self);

        loop {
            let (stream, peer) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = Arc::clone(&server);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { Ok::<_, Infallible>(server.handle(req).await) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Connection from {} ended with error: {:?}", peer, err);
                }
            });
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("Failed to read request body: {}", e);
                return error_response(&ProxyError::NetworkError(e.to_string()));
            }
        };

        let mut request =
            match InboundRequest::from_http(Request::from_parts(parts, body), &self.default_scheme) {
                Ok(request) => request,
                Err(e) => return error_response(&e),
            };

        self.dispatcher.begin_navigation_preload(&mut request);

        let url = request.url.clone();
        match self.dispatcher.handle(request).await {
            Ok(response) => response,
            Err(e) => {
                error!("Request for {} failed: {}", url, e);
                error_response(&e)
            }
        }
    }
}
