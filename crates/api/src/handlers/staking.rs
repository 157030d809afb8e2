use std::sync::Arc;

use actix_web::{web, HttpResponse};

use gateway_domain::capability::{QueryParams, StakingDataService};
use gateway_domain::model::EthAddress;

use super::ApiError;

type Staking = web::Data<Arc<dyn StakingDataService>>;

pub fn staking_router(service: Arc<dyn StakingDataService>) -> impl Fn(&mut web::ServiceConfig) {
    move |cfg| {
        cfg.app_data(web::Data::new(service.clone()))
            .route("/pools", web::get().to(pools))
            .route("/pools/{pool_id}", web::get().to(pool))
            .route("/epochs", web::get().to(epochs))
            .route("/stats", web::get().to(stats))
            .route("/delegator/{address}", web::get().to(delegator));
    }
}

async fn pools(service: Staking, query: web::Query<QueryParams>) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(service.pools(&query).await?))
}

async fn pool(service: Staking, pool_id: web::Path<String>) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(service.pool(&pool_id).await?))
}

async fn epochs(
    service: Staking,
    query: web::Query<QueryParams>,
) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(service.epochs(&query).await?))
}

async fn stats(service: Staking) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(service.stats().await?))
}

async fn delegator(service: Staking, address: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let address = EthAddress::parse(&address)?;
    Ok(HttpResponse::Ok().json(service.delegator(&address).await?))
}
