use std::sync::Arc;

use actix_web::{web, HttpResponse};

use gateway_domain::capability::{MetaTransactionService, QueryParams};

use super::ApiError;

type MetaTransactions = web::Data<Arc<dyn MetaTransactionService>>;

pub fn meta_transaction_router(
    service: Arc<dyn MetaTransactionService>,
) -> impl Fn(&mut web::ServiceConfig) {
    move |cfg| {
        cfg.app_data(web::Data::new(service.clone()))
            .route("/price", web::get().to(price))
            .route("/quote", web::get().to(quote))
            .route("/status/{tx_hash}", web::get().to(status));
    }
}

async fn price(
    service: MetaTransactions,
    query: web::Query<QueryParams>,
) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(service.price(&query).await?))
}

async fn quote(
    service: MetaTransactions,
    query: web::Query<QueryParams>,
) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(service.quote(&query).await?))
}

async fn status(
    service: MetaTransactions,
    tx_hash: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(service.status(&tx_hash).await?))
}
