//! Admin HTTP endpoint
//!
//! Served on its own address, separate from proxied traffic:
//!
//! - `GET /metrics` - Prometheus text format
//! - `GET /health` - liveness and cache lifecycle state
//! - `GET /lifecycle` - current generation and state
//! - `POST /lifecycle/skip-waiting` - activate the installed generation now
//! - `DELETE /tiles` - drop every stored tile, or one object's with `?object=<id>`

use crate::cache_store::{ActivationReport, LifecycleState};
use crate::dispatcher::ProxyDispatcher;
use crate::models::ObjectId;
use crate::tile_store::TileStore;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Debug, Serialize)]
struct HealthBody<'a> {
    status: &'a str,
    cache_version: &'a str,
    lifecycle: LifecycleState,
}

#[derive(Debug, Serialize)]
struct LifecycleBody<'a> {
    cache_version: &'a str,
    state: LifecycleState,
    navigation_preload: bool,
    clients_claimed: bool,
}

#[derive(Debug, Serialize)]
struct SkipWaitingBody {
    activated: bool,
    report: Option<ActivationReport>,
}

#[derive(Debug, Serialize)]
struct PurgeBody {
    success: bool,
    object: Option<String>,
    message: String,
}

/// Admin endpoint server
pub struct AdminEndpoint {
    dispatcher: Arc<ProxyDispatcher>,
    tile_store: Option<Arc<dyn TileStore>>,
    addr: SocketAddr,
}

impl AdminEndpoint {
    pub fn new(
        dispatcher: Arc<ProxyDispatcher>,
        tile_store: Option<Arc<dyn TileStore>>,
        addr: SocketAddr,
    ) -> Self {
        Self {
            dispatcher,
            tile_store,
            addr,
        }
    }

    /// Serve until the process exits
    pub async fn start(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Admin endpoint listening on http://{}", self.addr);

        let endpoint = Arc::new(self);
        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let endpoint = Arc::clone(&endpoint);

            tokio::task::spawn(async move {
                let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                    let endpoint = Arc::clone(&endpoint);
                    let (parts, _) = req.into_parts();
                    async move { Ok::<_, Infallible>(endpoint.handle(&parts.method, &parts.uri).await) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving admin connection: {:?}", err);
                }
            });
        }
    }

    /// Route one admin request
    pub async fn handle(&self, method: &Method, uri: &Uri) -> Response<Full<Bytes>> {
        match (method, uri.path()) {
            (&Method::GET, "/metrics") => self.metrics_response(),
            (&Method::GET, "/health") => self.health_response(),
            (&Method::GET, "/lifecycle") => self.lifecycle_response(),
            (&Method::POST, "/lifecycle/skip-waiting") => self.skip_waiting_response().await,
            (&Method::DELETE, "/tiles") => self.purge_response(uri.query()).await,
            (_, "/metrics" | "/health" | "/lifecycle" | "/lifecycle/skip-waiting" | "/tiles") => {
                text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
            }
            _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
        }
    }

    fn metrics_response(&self) -> Response<Full<Bytes>> {
        match self.dispatcher.metrics().encode() {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))),
            Err(e) => {
                warn!("Failed to encode metrics: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
            }
        }
    }

    fn health_response(&self) -> Response<Full<Bytes>> {
        let cache = self.dispatcher.cache();
        let lifecycle = cache.state();
        let status = if lifecycle == LifecycleState::Active {
            "healthy"
        } else {
            "starting"
        };
        json_response(
            StatusCode::OK,
            &HealthBody {
                status,
                cache_version: cache.current_version(),
                lifecycle,
            },
        )
    }

    fn lifecycle_response(&self) -> Response<Full<Bytes>> {
        let cache = self.dispatcher.cache();
        json_response(
            StatusCode::OK,
            &LifecycleBody {
                cache_version: cache.current_version(),
                state: cache.state(),
                navigation_preload: cache.navigation_preload_enabled(),
                clients_claimed: cache.clients_claimed(),
            },
        )
    }

    async fn skip_waiting_response(&self) -> Response<Full<Bytes>> {
        match self.dispatcher.cache().skip_waiting().await {
            Ok(report) => json_response(
                StatusCode::OK,
                &SkipWaitingBody {
                    activated: report.is_some(),
                    report,
                },
            ),
            Err(e) => {
                warn!("Skip-waiting failed: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
            }
        }
    }

    async fn purge_response(&self, query: Option<&str>) -> Response<Full<Bytes>> {
        let Some(store) = &self.tile_store else {
            return json_response(
                StatusCode::NOT_FOUND,
                &PurgeBody {
                    success: false,
                    object: None,
                    message: "No tile store configured".to_string(),
                },
            );
        };

        let object = query.and_then(|q| query_param(q, "object"));

        let result = match &object {
            Some(id) => match ObjectId::new(id.clone()) {
                Ok(object_id) => {
                    self.dispatcher.resolver().forget(&object_id).await;
                    store.remove_object(&object_id).await
                }
                Err(e) => {
                    return json_response(
                        StatusCode::BAD_REQUEST,
                        &PurgeBody {
                            success: false,
                            object: object.clone(),
                            message: e.to_string(),
                        },
                    )
                }
            },
            None => {
                self.dispatcher.resolver().forget_all().await;
                store.clear().await
            }
        };

        match result {
            Ok(()) => {
                info!("Purged tiles for {:?}", object);
                json_response(
                    StatusCode::OK,
                    &PurgeBody {
                        success: true,
                        message: match &object {
                            Some(id) => format!("Purged tiles of {}", id),
                            None => "Purged all tiles".to_string(),
                        },
                        object,
                    },
                )
            }
            Err(e) => {
                warn!("Tile purge failed: {}", e);
                json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &PurgeBody {
                        success: false,
                        object,
                        message: e.to_string(),
                    },
                )
            }
        }
    }
}

/// Percent-decoded value of the first `name` parameter in `query`
fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| percent_decode_str(key).decode_utf8_lossy() == name)
        .map(|(_, value)| percent_decode_str(value).decode_utf8_lossy().into_owned())
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(json) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(json)))
            .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))),
        Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn text_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::{MemoryCacheStorage, VersionedCacheStore};
    use crate::config::TileProxyConfig;
    use crate::metrics::ProxyMetrics;
    use crate::tile_store::MemoryTileStore;
    use http_body_util::BodyExt;

    fn endpoint() -> (AdminEndpoint, Arc<MemoryTileStore>) {
        let config = TileProxyConfig::default();
        let cache = Arc::new(VersionedCacheStore::new(
            Arc::new(MemoryCacheStorage::new()),
            config.cache_version_name(),
        ));
        let tiles = Arc::new(MemoryTileStore::new());
        let store: Arc<dyn TileStore> = tiles.clone();
        let metrics = Arc::new(ProxyMetrics::new().unwrap());
        let dispatcher =
            Arc::new(ProxyDispatcher::new(&config, cache, Some(store.clone()), metrics).unwrap());
        (
            AdminEndpoint::new(dispatcher, Some(store), "127.0.0.1:0".parse().unwrap()),
            tiles,
        )
    }

    async fn call(endpoint: &AdminEndpoint, method: Method, uri: &str) -> Response<Full<Bytes>> {
        endpoint.handle(&method, &uri.parse::<Uri>().unwrap()).await
    }

    async fn body_string(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_route() {
        let (endpoint, _) = endpoint();
        let response = call(&endpoint, Method::GET, "/metrics").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_before_activation() {
        let (endpoint, _) = endpoint();
        let response = call(&endpoint, Method::GET, "/health").await;
        let body = body_string(response).await;
        assert!(body.contains("\"status\":\"starting\""));
        assert!(body.contains("\"lifecycle\":\"pending\""));
    }

    #[tokio::test]
    async fn test_skip_waiting_activates_installed_generation() {
        let (endpoint, _) = endpoint();
        endpoint.dispatcher.install(&[], 1).await.unwrap();

        let response = call(&endpoint, Method::POST, "/lifecycle/skip-waiting").await;
        let body = body_string(response).await;
        assert!(body.contains("\"activated\":true"));
        assert_eq!(endpoint.dispatcher.cache().state(), LifecycleState::Active);
    }

    #[tokio::test]
    async fn test_purge_one_object() {
        let (endpoint, tiles) = endpoint();
        let a = ObjectId::new("a").unwrap();
        let b = ObjectId::new("b").unwrap();
        tiles.put(&a, 0, Bytes::from_static(b"1")).await.unwrap();
        tiles.put(&b, 0, Bytes::from_static(b"2")).await.unwrap();

        let response = call(&endpoint, Method::DELETE, "/tiles?object=a").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(tiles.len().await, 1);

        let response = call(&endpoint, Method::DELETE, "/tiles").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(tiles.is_empty().await);
    }

    #[test]
    fn test_query_param_is_decoded() {
        assert_eq!(query_param("object=a%20b", "object"), Some("a b".to_string()));
        assert_eq!(query_param("x=1&object=c", "object"), Some("c".to_string()));
        assert_eq!(query_param("objects=c", "object"), None);
    }

    #[tokio::test]
    async fn test_purge_encoded_object_id() {
        let (endpoint, tiles) = endpoint();
        let spaced = ObjectId::new("a b").unwrap();
        tiles.put(&spaced, 0, Bytes::from_static(b"1")).await.unwrap();
        tiles.put(&spaced, 1, Bytes::from_static(b"2")).await.unwrap();

        let response = call(&endpoint, Method::DELETE, "/tiles?object=a%20b").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("\"object\":\"a b\""));
        assert!(tiles.is_empty().await);
    }

    #[tokio::test]
    async fn test_wrong_method_and_unknown_path() {
        let (endpoint, _) = endpoint();
        let response = call(&endpoint, Method::GET, "/tiles").await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        let response = call(&endpoint, Method::GET, "/nope").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
