mod config;
mod error;
mod helm;
mod kubernetes;
mod metrics;

use actix_web::{middleware, web, App, HttpResponse, HttpServer, Responder};
use actix_web_opentelemetry::{PrometheusMetricsHandler, RequestMetrics, RequestTracing};
use futures_util::future;
use opentelemetry::global;
use opentelemetry_sdk::metrics::MeterProvider;
use prometheus::Registry;

use crate::config::Config;
use crate::error::{format_anyhow_chain, format_error_chain, AppError, AppResult};

async fn healthz() -> impl Responder {
    HttpResponse::Ok().body("ok")
}

async fn start_http(registry: Registry, addr: String) -> Result<(), std::io::Error> {
    log::info!("Starting HTTP server at http://{}/metrics", addr);

    HttpServer::new(move || {
        App::new()
            .wrap(RequestTracing::new())
            .wrap(RequestMetrics::default())
            .wrap(middleware::Logger::default())
            .route(
                "/metrics",
                web::get().to(PrometheusMetricsHandler::new(registry.clone())),
            )
            .route("/healthz", web::get().to(healthz))
    })
    .bind(addr)?
    .run()
    .await
}

async fn run() -> AppResult<()> {
    let config = Config::from_env()?;

    let registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()
        .map_err(|e| AppError::Metrics(e.to_string()))?;
    let provider = MeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(provider);
    metrics::init(&registry).map_err(|e| AppError::Metrics(format_anyhow_chain(&e)))?;

    let kube_config = kube::Config::infer()
        .await
        .map_err(|e| AppError::KubernetesConfig(e.to_string()))?;
    let client = kube::Client::try_from(kube_config)?;

    let http = Box::pin(start_http(registry, config.metrics_addr.clone()));
    let controller = Box::pin(kubernetes::start_controller(client, config));

    match future::select(http, controller).await {
        future::Either::Left((result, _)) => {
            result?;
            log::info!("HTTP server exited");
        }
        future::Either::Right(((), _)) => {}
    }

    Ok(())
}

#[actix_web::main]
async fn main() -> std::process::ExitCode {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", format_error_chain(&e));
            std::process::ExitCode::FAILURE
        }
    }
}
