use std::sync::Arc;

use actix_web::{web, HttpResponse};

use gateway_domain::capability::{QueryParams, SwapService};

use super::ApiError;

type Swap = web::Data<Arc<dyn SwapService>>;

pub fn swap_router(service: Arc<dyn SwapService>) -> impl Fn(&mut web::ServiceConfig) {
    move |cfg| {
        cfg.app_data(web::Data::new(service.clone()))
            .route("/quote", web::get().to(quote))
            .route("/price", web::get().to(price))
            .route("/sources", web::get().to(sources))
            .route("/tokens", web::get().to(tokens));
    }
}

async fn quote(service: Swap, query: web::Query<QueryParams>) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(service.quote(&query).await?))
}

async fn price(service: Swap, query: web::Query<QueryParams>) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(service.price(&query).await?))
}

async fn sources(service: Swap) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(service.sources().await?))
}

async fn tokens(service: Swap) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(service.tokens().await?))
}
