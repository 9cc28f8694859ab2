use actix_web::{get, HttpResponse, Responder};

#[get("/health/liveness")]
pub async fn liveness() -> impl Responder {
    HttpResponse::Ok().json("alive")
}

#[get("/health/readiness")]
pub async fn readiness() -> impl Responder {
    HttpResponse::Ok().json("ready")
}
