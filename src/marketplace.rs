//! Adapter traits for the external marketplaces, plus an HTTP client for a
//! generic marketplace gateway.
//!
//! Implementations convert their transport failures into [`OpError`] at
//! this boundary so the self-healer can act on a typed [`FailureKind`].

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::MarketplaceConfig;
use crate::error::{FailureKind, OpError};

/// Marketplace response to a write
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteAck {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// HTTP status of a rejected write, when the marketplace reports one
    #[serde(default)]
    pub status: Option<u16>,
}

impl WriteAck {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn rejected(status: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            status,
        }
    }

    /// A rejected ack becomes a classified error.
    pub fn into_result(self) -> Result<Value, OpError> {
        if self.success {
            return Ok(serde_json::json!({ "success": true }));
        }
        let message = self.error.unwrap_or_else(|| "write rejected".to_string());
        Err(match self.status {
            Some(status) => OpError::http(status, message),
            None => OpError::from_message(message),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitorOffer {
    pub seller: String,
    pub price: f64,
    pub stock: u32,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketplaceWriter: Send + Sync {
    async fn update_price(&self, sku: &str, price: f64) -> Result<WriteAck, OpError>;
    async fn update_stock(&self, sku: &str, quantity: u32) -> Result<WriteAck, OpError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompetitorSource: Send + Sync {
    async fn competitor_prices(&self, sku: &str) -> Result<Vec<CompetitorOffer>, OpError>;
}

/// Competitor lookup response: `{success, data: [...], error?}`
#[derive(Debug, Deserialize)]
struct OffersResponse {
    success: bool,
    #[serde(default)]
    data: Vec<CompetitorOffer>,
    #[serde(default)]
    error: Option<String>,
}

/// Client for a marketplace gateway exposing
/// `POST {base}/products/{sku}/price`, `POST {base}/products/{sku}/stock`
/// and `GET {base}/products/{sku}/competitors`.
pub struct HttpMarketplace {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpMarketplace {
    pub fn new(config: &MarketplaceConfig) -> Result<Self, OpError> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            OpError::new(
                FailureKind::BadRequest,
                format!("invalid marketplace base_url '{}': {}", config.base_url, e),
            )
        })?;
        if base_url.cannot_be_a_base() {
            return Err(OpError::new(
                FailureKind::BadRequest,
                format!("marketplace base_url '{}' cannot hold a path", config.base_url),
            ));
        }
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
        })
    }

    /// `{base}/products/{sku}/{leaf}` with the SKU percent-encoded
    fn product_url(&self, sku: &str, leaf: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["products", sku, leaf]);
        }
        url
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn write(&self, url: Url, body: Value) -> Result<WriteAck, OpError> {
        debug!(url = %url, "marketplace write");
        let response = self
            .authorized(self.client.post(url))
            .json(&body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        parse_ack(status, &body)
    }
}

#[async_trait]
impl MarketplaceWriter for HttpMarketplace {
    async fn update_price(&self, sku: &str, price: f64) -> Result<WriteAck, OpError> {
        let url = self.product_url(sku, "price");
        self.write(url, serde_json::json!({ "price": price })).await
    }

    async fn update_stock(&self, sku: &str, quantity: u32) -> Result<WriteAck, OpError> {
        let url = self.product_url(sku, "stock");
        self.write(url, serde_json::json!({ "quantity": quantity })).await
    }
}

#[async_trait]
impl CompetitorSource for HttpMarketplace {
    async fn competitor_prices(&self, sku: &str) -> Result<Vec<CompetitorOffer>, OpError> {
        let url = self.product_url(sku, "competitors");
        let response = self.authorized(self.client.get(url)).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        parse_offers(status, &body)
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

/// A non-2xx status is a rejected ack carrying the status, so that
/// [`WriteAck::into_result`] classifies it. An empty 2xx body is success.
fn parse_ack(status: u16, body: &str) -> Result<WriteAck, OpError> {
    if !(200..300).contains(&status) {
        let error = serde_json::from_str::<WriteAck>(body)
            .ok()
            .and_then(|ack| ack.error)
            .unwrap_or_else(|| snippet(body));
        return Ok(WriteAck::rejected(Some(status), error));
    }
    if body.trim().is_empty() {
        return Ok(WriteAck::ok());
    }
    Ok(serde_json::from_str(body)?)
}

fn parse_offers(status: u16, body: &str) -> Result<Vec<CompetitorOffer>, OpError> {
    if !(200..300).contains(&status) {
        return Err(OpError::http(status, format!("competitor lookup: {}", snippet(body))));
    }
    let parsed: OffersResponse = serde_json::from_str(body)?;
    if !parsed.success {
        return Err(OpError::from_message(
            parsed
                .error
                .unwrap_or_else(|| "competitor lookup failed".to_string()),
        ));
    }
    Ok(parsed.data)
}
