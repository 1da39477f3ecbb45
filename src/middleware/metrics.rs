//! Per-endpoint request counting and timing. Paths are normalized so that
//! `/api/v1/rooms/abc123/users` and `/api/v1/rooms/xyz/users` land in the
//! same metric bucket instead of one bucket per id.

use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

pub struct MetricsMiddleware;

/// Collapse id-like path segments into ":id".
///
/// A segment counts as id-like if it follows a known collection segment
/// (rooms, sessions, streams, ws) — route ids are free-form strings here,
/// so shape-based detection alone would miss codes like "team".
fn normalize_path(path: &str) -> String {
    const COLLECTIONS: [&str; 4] = ["rooms", "sessions", "streams", "ws"];
    let mut parts: Vec<String> = Vec::new();
    let mut previous: Option<&str> = None;
    for segment in path.split('/') {
        let replaced = match previous {
            Some(prev) if COLLECTIONS.contains(&prev) && !segment.is_empty() => ":id",
            _ => segment,
        };
        parts.push(replaced.to_string());
        previous = Some(segment);
    }
    parts.join("/")
}

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let method = req.method().to_string();
        let endpoint = format!("{} {}", method, normalize_path(req.uri().path()));

        if let Some(app_state) = req.app_data::<web::Data<AppState>>() {
            app_state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            let is_error = match &result {
                Ok(response) => {
                    response.status().is_client_error() || response.status().is_server_error()
                }
                Err(_) => true,
            };

            if let Ok(response) = &result {
                if let Some(app_state) = response.request().app_data::<web::Data<AppState>>() {
                    app_state.record_endpoint_request(&endpoint, duration_ms, is_error);

                    if is_error {
                        app_state.increment_error_count();
                    }
                }
            }

            result
        })
    }
}
