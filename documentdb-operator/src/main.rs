use actix_web::{
    get, middleware, post, web, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
pub use controller::{self, telemetry, State};
use controller::{
    apis::conversion::{convert_review, ConversionReview},
    config::Config,
};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};
use prometheus::{Encoder, TextEncoder};

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&metrics, &mut buffer).unwrap();
    HttpResponse::Ok().body(buffer)
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

// Multi-version conversion endpoint the apiserver calls when serving a
// non-storage version of the DocumentDB resource
#[post("/convert")]
async fn convert(body: web::Json<ConversionReview>) -> impl Responder {
    HttpResponse::Ok().json(convert_review(body.into_inner()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init().await;
    let cfg = Config::default();

    // Initiatilize Kubernetes controller state
    let state = State::default();
    let controller = controller::run(state.clone());

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind("0.0.0.0:8080")?
    .shutdown_timeout(5);

    // The conversion webhook must be served over TLS; without certificates
    // the listener stays off and only the stored hub version is usable.
    if !cfg.conversion_tls_cert.is_empty() && !cfg.conversion_tls_key.is_empty() {
        let mut tls_config = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;
        tls_config.set_private_key_file(&cfg.conversion_tls_key, SslFiletype::PEM)?;
        tls_config.set_certificate_chain_file(&cfg.conversion_tls_cert)?;
        let conversion_server = HttpServer::new(|| App::new().service(convert))
            .bind_openssl(format!("0.0.0.0:{}", cfg.conversion_port), tls_config)?
            .shutdown_timeout(5);

        // All runtimes implement graceful shutdown, so poll until all are done
        let (_, web_result, conversion_result) =
            tokio::join!(controller, server.run(), conversion_server.run());
        web_result?;
        conversion_result?;
    } else {
        // Both runtimes implements graceful shutdown, so poll until both are done
        tokio::join!(controller, server.run()).1?;
    }
    Ok(())
}
