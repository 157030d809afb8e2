use std::time::Duration;

use gateway_domain::capability::{Capability, QueryParams, ServiceError, ServiceResult};
use metrics::counter;
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;
use url::Url;

use crate::UpstreamError;

const SEGMENT_BASE: &str = "http://segment.invalid/";

/// JSON client bound to one capability's upstream base URL.
#[derive(Clone)]
pub struct UpstreamClient {
    capability: Capability,
    base_url: Url,
    http: Client,
}

impl UpstreamClient {
    pub fn new(
        capability: Capability,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let mut base_url = Url::parse(base_url).map_err(|err| UpstreamError::InvalidUrl {
            url: base_url.to_string(),
            reason: err.to_string(),
        })?;
        // `Url::join` replaces the last segment unless the base ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            capability,
            base_url,
            http,
        })
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, ServiceError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(ServiceError::from_source)
    }

    pub async fn get_json<T>(&self, path: &str, query: &QueryParams) -> ServiceResult<T>
    where
        T: DeserializeOwned,
    {
        let response = self
            .http
            .get(self.endpoint(path)?)
            .query(query)
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;
        self.decode(response).await
    }

    pub async fn post_json<B>(&self, path: &str, body: &B) -> ServiceResult<()>
    where
        B: Serialize + ?Sized,
    {
        let response = self
            .http
            .post(self.endpoint(path)?)
            .json(body)
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;
        let status = response.status();
        if status.is_success() {
            self.record("ok");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(self.rejected(status, body))
    }

    async fn decode<T>(&self, response: Response) -> ServiceResult<T>
    where
        T: DeserializeOwned,
    {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.rejected(status, body));
        }
        let decoded = response.json::<T>().await.map_err(|err| {
            self.record("decode_error");
            ServiceError::Unavailable(format!("malformed upstream response: {err}"))
        })?;
        self.record("ok");
        Ok(decoded)
    }

    fn rejected(&self, status: StatusCode, body: String) -> ServiceError {
        self.record("rejected");
        classify_status(status, body)
    }

    fn transport_error(&self, err: reqwest::Error) -> ServiceError {
        self.record("transport_error");
        warn!(capability = self.capability.name(), ?err, "upstream request failed");
        ServiceError::Unavailable(err.to_string())
    }

    fn record(&self, result: &'static str) {
        counter!(
            "gateway_upstream_requests_total",
            "capability" => self.capability.name(),
            "result" => result
        )
        .increment(1);
    }
}

/// Maps a non-success upstream status onto the collaborator error taxonomy.
pub fn classify_status(status: StatusCode, body: String) -> ServiceError {
    if status == StatusCode::NOT_FOUND {
        ServiceError::NotFound
    } else if status.is_client_error() {
        ServiceError::Validation(if body.is_empty() {
            status.to_string()
        } else {
            body
        })
    } else {
        ServiceError::Unavailable(format!("upstream responded with {status}"))
    }
}

/// Percent-encodes a caller-supplied value as exactly one path segment.
/// Dot segments are refused since `Url::join` would resolve them away.
pub fn path_segment(raw: &str) -> ServiceResult<String> {
    if matches!(raw, "" | "." | "..") {
        return Err(ServiceError::Validation(format!("invalid path segment `{raw}`")));
    }
    let mut scratch = Url::parse(SEGMENT_BASE).map_err(ServiceError::from_source)?;
    scratch
        .path_segments_mut()
        .map_err(|()| ServiceError::Internal("segment base has no path".into()))?
        .clear()
        .push(raw);
    Ok(scratch.path().trim_start_matches('/').to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> UpstreamClient {
        UpstreamClient::new(Capability::Swap, base, Duration::from_secs(1)).expect("client builds")
    }

    #[test]
    fn endpoint_keeps_base_path() {
        let client = client("http://swap.local/api/v1");
        assert_eq!(
            client.endpoint("quote").unwrap().as_str(),
            "http://swap.local/api/v1/quote"
        );
        assert_eq!(
            client.endpoint("/sources").unwrap().as_str(),
            "http://swap.local/api/v1/sources"
        );
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let err = UpstreamClient::new(Capability::Swap, "not a url", Duration::from_secs(1))
            .err()
            .expect("invalid url");
        assert!(matches!(err, UpstreamError::InvalidUrl { .. }));
    }

    #[test]
    fn statuses_map_onto_service_errors() {
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, String::new()),
            ServiceError::NotFound
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, "bad taker".into()),
            ServiceError::Validation("bad taker".into())
        );
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, String::new()),
            ServiceError::Unavailable(_)
        ));
    }

    #[test]
    fn path_segments_are_escaped() {
        assert_eq!(path_segment("abc").unwrap(), "abc");
        assert_eq!(path_segment("../admin").unwrap(), "..%2Fadmin");
        assert_eq!(path_segment("a b").unwrap(), "a%20b");
        assert_eq!(path_segment("a?b#c").unwrap(), "a%3Fb%23c");
        assert_eq!(path_segment("50%").unwrap(), "50%25");
    }

    #[test]
    fn dot_segments_are_refused() {
        for raw in ["", ".", ".."] {
            assert!(matches!(path_segment(raw), Err(ServiceError::Validation(_))));
        }
    }

    #[test]
    fn escaped_segments_stay_below_the_base_path() {
        let client = client("http://up.local/staking/v1");
        let url = client
            .endpoint(&format!("pools/{}", path_segment("a b").unwrap()))
            .unwrap();
        assert_eq!(url.as_str(), "http://up.local/staking/v1/pools/a%20b");
        let url = client
            .endpoint(&format!("pools/{}", path_segment("../admin").unwrap()))
            .unwrap();
        assert_eq!(url.as_str(), "http://up.local/staking/v1/pools/..%2Fadmin");
    }
}
