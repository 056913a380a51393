#![forbid(unsafe_code)]
#![deny(warnings)]
#![warn(clippy::pedantic)]

use actix_web::{get, http::StatusCode, web, App, HttpResponse, HttpServer};
use serde_json::json;
use std::str::FromStr;
use tracing::{error, info, warn};

use crate::domain::Resource;
use crate::service::ControllerRunner;

#[derive(Clone)]
pub struct AppState {
    pub runner: ControllerRunner,
}

#[get("/healthz")]
pub async fn healthz(data: web::Data<AppState>) -> HttpResponse {
    let report = data.runner.health();
    if report.status == "ok" {
        HttpResponse::Ok().json(report)
    } else {
        HttpResponse::ServiceUnavailable().json(report)
    }
}

#[get("/status")]
pub async fn status(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.runner.status())
}

#[get("/status/{resource}")]
pub async fn resource_status(path: web::Path<String>, data: web::Data<AppState>) -> HttpResponse {
    let raw = path.into_inner();
    let Ok(resource) = Resource::from_str(&raw) else {
        warn!(resource = %raw, "status: unknown resource");
        return json_error(StatusCode::NOT_FOUND, &format!("unknown resource: {raw}"));
    };
    match data.runner.status().get(resource) {
        Some(st) => HttpResponse::Ok().json(st),
        None => json_error(StatusCode::NOT_FOUND, &format!("{resource} control is disabled")),
    }
}

#[get("/metrics")]
pub async fn scrape_metrics(data: web::Data<AppState>) -> HttpResponse {
    match data.runner.encode_metrics() {
        Ok(buf) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(buf),
        Err(e) => {
            error!(error=%format!("{e:#}"), "encode metrics failed");
            HttpResponse::InternalServerError().body("encode metrics failed")
        }
    }
}

/// Serves the read-only status surface until the returned future is dropped.
/// Signal handling is left to the caller.
pub async fn serve(bind: &str, state: AppState) -> std::io::Result<()> {
    info!(bind, "status listener starting");
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(healthz)
            .service(status)
            .service(resource_status)
            .service(scrape_metrics)
    })
    .disable_signals()
    .workers(1)
    .bind(bind)?
    .run()
    .await
}

fn json_error(code: StatusCode, reason: &str) -> HttpResponse {
    HttpResponse::build(code).json(json!({"status":"error","reason":reason}))
}
