use actix_cors::Cors;
use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agentpay_gateway::routes;
use agentpay_gateway::{AppState, Backend, GatewayConfig};

fn build_cors(origins: &[String]) -> Cors {
    if origins.is_empty() {
        Cors::default()
            .allowed_origin_fn(|origin, _| {
                origin
                    .to_str()
                    .map(|o| o == "http://localhost" || o.starts_with("http://localhost:"))
                    .unwrap_or(false)
            })
            .allow_any_method()
            .allow_any_header()
            .expose_headers(vec![agentpay::RECEIPT_HEADER])
            .max_age(3600)
    } else {
        let mut cors = Cors::default();
        for origin in origins {
            cors = cors.allowed_origin(origin);
        }
        cors.allow_any_method()
            .allow_any_header()
            .expose_headers(vec![agentpay::RECEIPT_HEADER])
            .max_age(3600)
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };
    tracing::debug!(?config, "configuration loaded");

    let backend = match Backend::from_config(&config) {
        Ok(backend) => backend,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize ledger");
            std::process::exit(1);
        }
    };

    let port = config.port;
    let cors_origins = config.allowed_origins.clone();

    tracing::info!("AgentPay gateway listening at http://localhost:{port}");
    tracing::info!(
        agent_id = %config.agent_id,
        service = %config.service_name,
        fallback_price = %config.service_price,
        ledger = backend.name(),
        chain_id = config.chain.chain_id,
        "payment gate configured"
    );
    tracing::info!("Endpoints: GET /resource (paid), GET /challenge, GET /health, GET /metrics");
    tracing::info!("Rate limit: {} req/min per IP", config.rate_limit_rpm);

    let state = web::Data::new(AppState::new(backend, &config));

    let governor_conf = GovernorConfigBuilder::default()
        .requests_per_minute(config.rate_limit_rpm)
        .finish()
        .ok_or_else(|| std::io::Error::other("failed to build rate limiter config"))?;

    HttpServer::new(move || {
        App::new()
            .wrap(build_cors(&cors_origins))
            .wrap(Governor::new(&governor_conf))
            .app_data(state.clone())
            .service(routes::health)
            .service(routes::metrics_endpoint)
            .service(routes::challenge)
            .service(routes::resource)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
