use std::collections::HashMap;

use async_trait::async_trait;
use format_url::FormatUrl;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::env::ENV_CONFIG;
use crate::units::UtcDay;

use super::{PriceApi, PriceError};

const CRYPTOCOMPARE_API: &str = "https://min-api.cryptocompare.com";

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ProviderErrorEnvelope {
    #[allow(unused)]
    #[serde(rename = "Response")]
    response: String,
    #[serde(rename = "Message")]
    message: String,
}

/// The provider reports errors inside a 200 body, `{SYM: {USD: price}}`
/// otherwise.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PriceHistoricalResponse {
    Error(ProviderErrorEnvelope),
    Prices(HashMap<String, HashMap<String, f64>>),
}

#[derive(Debug, Deserialize)]
struct HistoDayPoint {
    time: i64,
    close: f64,
}

#[derive(Debug, Deserialize)]
struct HistoDayData {
    #[serde(rename = "Data", default)]
    data: Vec<HistoDayPoint>,
}

#[derive(Debug, Deserialize)]
struct HistoDayResponse {
    #[serde(rename = "Response")]
    response: String,
    #[serde(rename = "Message", default)]
    message: String,
    #[serde(rename = "Data")]
    data: Option<HistoDayData>,
}

fn classify_provider_error(message: String) -> PriceError {
    if message.to_lowercase().contains("rate limit") {
        PriceError::RateLimited
    } else {
        PriceError::Provider(message)
    }
}

pub struct CryptoCompareApi {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl CryptoCompareApi {
    pub fn new() -> Self {
        Self::new_with_url_and_key(
            CRYPTOCOMPARE_API.to_string(),
            ENV_CONFIG.cryptocompare_api_key.clone(),
        )
    }

    pub fn new_with_url(base_url: String) -> Self {
        Self::new_with_url_and_key(base_url, None)
    }

    fn new_with_url_and_key(base_url: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("expect reqwest client to build"),
            base_url,
            api_key,
        }
    }
}

#[async_trait]
impl PriceApi for CryptoCompareApi {
    async fn usd_price_on(&self, symbol: &str, day: UtcDay) -> Result<f64, PriceError> {
        let ts = day.0.to_string();
        let mut query_params = vec![("fsym", symbol), ("tsyms", "USD"), ("ts", ts.as_str())];
        if let Some(ref api_key) = self.api_key {
            query_params.push(("api_key", api_key.as_str()));
        }
        let url = FormatUrl::new(&self.base_url)
            .with_path_template("/data/pricehistorical")
            .with_query_params(query_params)
            .format_url();

        debug!("sending request to {}", url);

        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(PriceError::RateLimited);
        }

        let body = response
            .error_for_status()?
            .json::<PriceHistoricalResponse>()
            .await?;

        match body {
            PriceHistoricalResponse::Error(envelope) => {
                Err(classify_provider_error(envelope.message))
            }
            PriceHistoricalResponse::Prices(prices) => {
                let usd = prices
                    .get(symbol)
                    .and_then(|quotes| quotes.get("USD"))
                    .copied();
                match usd {
                    // The provider zero-fills days it has no price for.
                    Some(usd) if usd > 0.0 => Ok(usd),
                    _ => Err(PriceError::NoPrice {
                        symbol: symbol.to_string(),
                        day,
                    }),
                }
            }
        }
    }

    async fn histo_day(
        &self,
        symbol: &str,
        to_day: UtcDay,
        limit: usize,
    ) -> Result<Vec<(UtcDay, f64)>, PriceError> {
        let to_ts = to_day.0.to_string();
        let limit = limit.to_string();
        let mut query_params = vec![
            ("fsym", symbol),
            ("tsym", "USD"),
            ("toTs", to_ts.as_str()),
            ("limit", limit.as_str()),
        ];
        if let Some(ref api_key) = self.api_key {
            query_params.push(("api_key", api_key.as_str()));
        }
        let url = FormatUrl::new(&self.base_url)
            .with_path_template("/data/v2/histoday")
            .with_query_params(query_params)
            .format_url();

        debug!("sending request to {}", url);

        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(PriceError::RateLimited);
        }

        let body = response
            .error_for_status()?
            .json::<HistoDayResponse>()
            .await?;

        if body.response != "Success" {
            return Err(classify_provider_error(body.message));
        }

        let points = body.data.map(|data| data.data).unwrap_or_default();
        Ok(points
            .into_iter()
            .filter(|point| point.close > 0.0)
            .map(|point| (UtcDay::from_timestamp(point.time), point.close))
            .collect())
    }
}
