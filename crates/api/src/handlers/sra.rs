//! Order-book routes in the standard relayer layout.

use std::sync::Arc;

use actix_web::{web, HttpResponse};

use gateway_domain::capability::{OrderBookService, Payload, QueryParams};

use super::ApiError;

type OrderBook = web::Data<Arc<dyn OrderBookService>>;

pub fn sra_router(service: Arc<dyn OrderBookService>) -> impl Fn(&mut web::ServiceConfig) {
    move |cfg| {
        cfg.app_data(web::Data::new(service.clone()))
            .route("/orders", web::get().to(orders))
            .route("/orders", web::post().to(post_orders))
            .route("/order/{order_hash}", web::get().to(order))
            .route("/order", web::post().to(post_order))
            .route("/orderbook", web::get().to(orderbook));
    }
}

async fn orders(
    service: OrderBook,
    query: web::Query<QueryParams>,
) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(service.orders(&query).await?))
}

async fn order(
    service: OrderBook,
    order_hash: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(service.order(&order_hash).await?))
}

async fn orderbook(
    service: OrderBook,
    query: web::Query<QueryParams>,
) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(service.orderbook(&query).await?))
}

async fn post_order(
    service: OrderBook,
    body: web::Json<Payload>,
) -> Result<HttpResponse, ApiError> {
    service.post_order(body.into_inner()).await?;
    Ok(HttpResponse::Ok().finish())
}

async fn post_orders(
    service: OrderBook,
    body: web::Json<Vec<Payload>>,
) -> Result<HttpResponse, ApiError> {
    service.post_orders(body.into_inner()).await?;
    Ok(HttpResponse::Ok().finish())
}
