//! Cross-cutting request stages shared by every mounted router.
//!
//! Stages run outermost first: request logging, CORS, address
//! normalization. JSON bodies are decoded by the `web::Json` extractor once
//! routing has matched, so [`json_config`] carries the decode policy.

use std::borrow::Cow;

use actix_cors::Cors;
use actix_web::{
    body::{EitherBody, MessageBody},
    dev::{ServiceRequest, ServiceResponse},
    http::Uri,
    middleware::Next,
    web, Error, ResponseError,
};
use metrics::counter;
use tracing::{debug, warn};
use url::form_urlencoded;

use gateway_domain::services::{RateLimitDecision, RateLimiter};

use crate::handlers::ApiError;

/// Upper bound on accepted JSON bodies.
pub const JSON_BODY_LIMIT: usize = 2 * 1024 * 1024;

const ADDRESS_SUFFIX: &str = "Address";
const API_KEY_HEADER: &str = "x-api-key";
const ANONYMOUS_CALLER: &str = "anonymous";

/// Any origin, any method, any header.
pub fn cors() -> Cors {
    Cors::permissive()
}

pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(JSON_BODY_LIMIT)
        .error_handler(|err, _req| ApiError::MalformedJson(err.to_string()).into())
}

pub fn query_config() -> web::QueryConfig {
    web::QueryConfig::default()
        .error_handler(|err, _req| ApiError::InvalidQuery(err.to_string()).into())
}

/// Lowercases every query value whose key ends in `Address`. Returns `None`
/// when the query is already normalized.
pub fn normalize_query(query: &str) -> Option<String> {
    let mut changed = false;
    let pairs: Vec<(Cow<'_, str>, Cow<'_, str>)> = form_urlencoded::parse(query.as_bytes())
        .map(|(key, value)| {
            if key.ends_with(ADDRESS_SUFFIX) && value.chars().any(|c| c.is_uppercase()) {
                changed = true;
                let lowered = value.to_lowercase();
                (key, Cow::Owned(lowered))
            } else {
                (key, value)
            }
        })
        .collect();

    if !changed {
        return None;
    }

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in &pairs {
        serializer.append_pair(key, value);
    }
    Some(serializer.finish())
}

pub async fn normalize_addresses(
    mut req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let rewritten = normalize_query(req.query_string())
        .map(|query| format!("{}?{}", req.path(), query));

    if let Some(path_and_query) = rewritten {
        match path_and_query.parse::<Uri>() {
            Ok(uri) => {
                debug!(uri = %uri, "normalized address parameters");
                req.match_info_mut().get_mut().update(&uri);
                req.head_mut().uri = uri;
            }
            Err(err) => warn!(%err, "could not rebuild normalized request uri"),
        }
    }

    next.call(req).await
}

/// Caller identity for rate limiting: the API key header when present,
/// otherwise the peer address.
pub fn caller_key(req: &ServiceRequest) -> String {
    if let Some(key) = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
    {
        return key.to_string();
    }
    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| ANONYMOUS_CALLER.to_string())
}

/// Applies the `RateLimiter` registered on the enclosing scope. Scopes
/// without one pass straight through.
pub async fn enforce_rate_limit(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<EitherBody<impl MessageBody>>, Error> {
    let decision = req
        .app_data::<web::Data<RateLimiter>>()
        .map(|limiter| limiter.check(&caller_key(&req)));

    if let Some(RateLimitDecision::Limited { retry_after }) = decision {
        counter!("gateway_rate_limited_total").increment(1);
        let response = ApiError::RateLimited { retry_after }.error_response();
        return Ok(req.into_response(response).map_into_right_body());
    }

    next.call(req).await.map(ServiceResponse::map_into_left_body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn lowercases_only_address_parameters() {
        let normalized =
            normalize_query("makerAddress=0xABCdef&symbol=ZRX&takerAddress=0x01").unwrap();
        assert_eq!(normalized, "makerAddress=0xabcdef&symbol=ZRX&takerAddress=0x01");
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_query("traderAddress=0xDEAD").unwrap();
        assert_eq!(normalize_query(&once), None);
    }

    #[test]
    fn suffix_match_is_case_sensitive() {
        assert_eq!(normalize_query("address=0xABC&makeraddress=0xABC"), None);
        assert_eq!(normalize_query(""), None);
    }

    #[test]
    fn caller_key_prefers_api_key() {
        let req = TestRequest::default()
            .insert_header((API_KEY_HEADER, "integrator"))
            .peer_addr("10.0.0.7:4000".parse().unwrap())
            .to_srv_request();
        assert_eq!(caller_key(&req), "integrator");

        let req = TestRequest::default()
            .peer_addr("10.0.0.7:4000".parse().unwrap())
            .to_srv_request();
        assert_eq!(caller_key(&req), "10.0.0.7");

        let req = TestRequest::default().to_srv_request();
        assert_eq!(caller_key(&req), ANONYMOUS_CALLER);
    }
}
