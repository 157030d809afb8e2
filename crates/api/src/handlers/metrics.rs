use std::sync::Arc;

use actix_web::{web, HttpResponse};

use gateway_domain::capability::MetricsService;

/// Registers the exposition endpoint at the root of the scope it is mounted
/// under, with or without a trailing slash.
pub fn metrics_router(service: Arc<dyn MetricsService>) -> impl Fn(&mut web::ServiceConfig) {
    move |cfg| {
        cfg.app_data(web::Data::new(service.clone()))
            .route("", web::get().to(metrics_handler))
            .route("/", web::get().to(metrics_handler));
    }
}

pub async fn metrics_handler(service: web::Data<Arc<dyn MetricsService>>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(service.render())
}
