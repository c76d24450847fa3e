//! Connection logging for both listeners.
//!
//! Every WebSocket upgrade (and every health probe) passes through here once,
//! so the log shows which listener a peer reached and how the upgrade went.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{error, info};

/// Logs connection requests tagged with the listener they arrived on.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLogging {
    role: &'static str,
}

impl ConnectionLogging {
    /// Logging for the listener ASR workers connect to.
    pub fn backend() -> Self {
        Self { role: "backend" }
    }

    /// Logging for the listener edge devices connect to.
    pub fn device() -> Self {
        Self { role: "device" }
    }
}

impl<S, B> Transform<S, ServiceRequest> for ConnectionLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = ConnectionLoggingMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ConnectionLoggingMiddleware {
            service,
            role: self.role,
        }))
    }
}

pub struct ConnectionLoggingMiddleware<S> {
    service: S,
    role: &'static str,
}

impl<S, B> Service<ServiceRequest> for ConnectionLoggingMiddleware<S>
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
        let role = self.role;
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let peer = req
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        info!(
            listener = role,
            method = %method,
            uri = %uri,
            peer = %peer,
            "Connection request"
        );

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration = start_time.elapsed();

            match &result {
                Ok(response) => {
                    info!(
                        listener = role,
                        uri = %uri,
                        peer = %peer,
                        status = %response.status().as_u16(),
                        duration_ms = %duration.as_millis(),
                        "Connection request handled"
                    );
                }
                Err(err) => {
                    error!(
                        listener = role,
                        uri = %uri,
                        peer = %peer,
                        duration_ms = %duration.as_millis(),
                        error = %err,
                        "Connection request failed"
                    );
                }
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, web, App, HttpResponse};

    #[actix_web::test]
    async fn test_logging_passes_response_through() {
        let app = test::init_service(
            App::new()
                .wrap(ConnectionLogging::device())
                .route("/", web::get().to(|| async { HttpResponse::Accepted().finish() })),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(resp.status().as_u16(), 202);
    }
}
