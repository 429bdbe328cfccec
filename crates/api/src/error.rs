//! Error types for external service clients.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    /// Response did not match the expected schema.
    #[error("invalid {endpoint} response: {source}")]
    Schema {
        endpoint: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("GraphQL errors: {0}")]
    GraphQl(String),

    #[error("no price for {0}")]
    MissingPrice(String),

    #[error("quote token {0} has a zero price")]
    ZeroQuotePrice(String),
}

pub type Result<T> = std::result::Result<T, ApiError>;

/// Fail on a non-2xx status, otherwise return the body bytes.
pub(crate) async fn read_body(
    endpoint: &'static str,
    response: reqwest::Response,
) -> Result<Vec<u8>> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            endpoint,
            status,
            body,
        });
    }
    Ok(response.bytes().await?.to_vec())
}

/// Strictly decode a body into `T`.
pub(crate) fn decode<T: serde::de::DeserializeOwned>(
    endpoint: &'static str,
    body: &[u8],
) -> Result<T> {
    serde_json::from_slice(body).map_err(|source| ApiError::Schema { endpoint, source })
}
