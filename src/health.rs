//! Health endpoint served on the device listener.
//!
//! Reports "healthy" while at least one ASR worker is connected and
//! "degraded" otherwise, since new devices are turned away with no worker.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let workers = state.pool.summaries();

    let status = if state.pool.is_empty() { "degraded" } else { "healthy" };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "device_port": config.server.device_port,
            "backend_port": config.server.backend_port
        },
        "workers": {
            "connected": workers.len(),
            "sessions": state.pool.session_count(),
            "pool": workers
        },
        "metrics": metrics,
        "audio": {
            "decode_sample_rate": config.audio.decode_sample_rate,
            "channels": config.audio.channels
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::relay::pool::WorkerKey;
    use crate::relay::test_support::RecordingLink;
    use actix_web::{test, App};
    use serde_json::Value;

    async fn fetch_health(state: AppState) -> Value {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        test::call_and_read_body_json(&app, req).await
    }

    #[actix_web::test]
    async fn test_health_degraded_without_workers() {
        let body = fetch_health(AppState::new(AppConfig::default())).await;

        assert_eq!(body["status"], "degraded");
        assert_eq!(body["workers"]["connected"], 0);
        assert_eq!(body["service"]["device_port"], 8082);
    }

    #[actix_web::test]
    async fn test_health_reports_workers_and_sessions() {
        let state = AppState::new(AppConfig::default());
        let key = WorkerKey::from_peer("10.0.0.5:7000".parse().unwrap());
        let worker = state.pool.register(key, RecordingLink::new()).unwrap();
        let (_session, _events) = worker.new_session().unwrap();
        state.record_device_accepted();

        let body = fetch_health(state).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["workers"]["connected"], 1);
        assert_eq!(body["workers"]["sessions"], 1);
        assert_eq!(body["workers"]["pool"][0]["key"], "10.0.0.5:7000");
        assert_eq!(body["metrics"]["active_devices"], 1);
    }
}
