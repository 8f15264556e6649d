//! REST adapter for an IG-style CFD/forex broker API.
//!
//! A `reqwest::Client` built once with connection pooling and default auth
//! headers, one method per endpoint, non-2xx responses converted into typed
//! errors rather than panicking on `.unwrap()`.

use super::{
    AccountSummary, BrokerAdapter, BrokerPosition, DealStatus, Direction, MarketDetails, OrderAck,
    WorkingOrder,
};
use crate::error::BrokerError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;

pub struct IgBrokerAdapter {
    client: Client,
    base_url: String,
    api_key: String,
    max_retries: u32,
}

impl IgBrokerAdapter {
    pub fn new(
        base_url: String,
        api_key: String,
        request_timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, BrokerError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            api_key,
            max_retries,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn auth_request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.header("X-IG-API-KEY", &self.api_key)
    }

    /// Retries transport and rate-limit errors with exponential backoff;
    /// auth and API (4xx non-rate-limit) errors fail fast.
    async fn with_retry<F, Fut, T>(&self, op: F) -> Result<T, BrokerError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, BrokerError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let backoff_ms = 100u64 * 2u64.pow(attempt.min(6));
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn classify_status(status: StatusCode, body: &str) -> BrokerError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                BrokerError::Auth(format!("{status}: {body}"))
            }
            StatusCode::TOO_MANY_REQUESTS => BrokerError::RateLimited { retry_after_ms: 1000 },
            s if s.is_server_error() => BrokerError::Transport(format!("{status}: {body}")),
            _ => BrokerError::Api(format!("{status}: {body}")),
        }
    }
}

#[async_trait]
impl BrokerAdapter for IgBrokerAdapter {
    async fn verify_session(&self) -> Result<(), BrokerError> {
        self.with_retry(|| async {
            let resp = self
                .auth_request(self.client.get(self.url("/session")))
                .send()
                .await
                .map_err(|e| BrokerError::Transport(e.to_string()))?;
            if resp.status().is_success() {
                Ok(())
            } else {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Err(Self::classify_status(status, &body))
            }
        })
        .await
    }

    async fn list_accounts(&self) -> Result<Vec<AccountSummary>, BrokerError> {
        self.with_retry(|| async {
            let resp = self
                .auth_request(self.client.get(self.url("/accounts")))
                .send()
                .await
                .map_err(|e| BrokerError::Transport(e.to_string()))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::classify_status(status, &body));
            }
            resp.json::<Vec<AccountSummary>>()
                .await
                .map_err(|e| BrokerError::Api(e.to_string()))
        })
        .await
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        self.with_retry(|| async {
            let resp = self
                .auth_request(self.client.get(self.url("/positions")))
                .send()
                .await
                .map_err(|e| BrokerError::Transport(e.to_string()))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::classify_status(status, &body));
            }
            resp.json::<Vec<BrokerPosition>>()
                .await
                .map_err(|e| BrokerError::Api(e.to_string()))
        })
        .await
    }

    async fn place_market_order(
        &self,
        epic: &str,
        direction: Direction,
        size: f64,
        stop_level: Option<f64>,
        limit_level: Option<f64>,
        deal_reference: &str,
    ) -> Result<OrderAck, BrokerError> {
        let body = serde_json::json!({
            "epic": epic,
            "direction": if direction == Direction::Buy { "BUY" } else { "SELL" },
            "size": size,
            "stopLevel": stop_level,
            "limitLevel": limit_level,
            "dealReference": deal_reference,
            "orderType": "MARKET",
        });
        self.with_retry(|| async {
            let resp = self
                .auth_request(self.client.post(self.url("/positions/otc")))
                .json(&body)
                .send()
                .await
                .map_err(|e| BrokerError::Transport(e.to_string()))?;
            let status = resp.status();
            let raw: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| BrokerError::Api(e.to_string()))?;
            if !status.is_success() {
                return Err(Self::classify_status(status, &raw.to_string()));
            }
            Ok(parse_ack(deal_reference, raw))
        })
        .await
    }

    async fn close_position(
        &self,
        deal_id: &str,
        direction: Direction,
        size: f64,
    ) -> Result<OrderAck, BrokerError> {
        let deal_reference = format!("close-{deal_id}");
        let body = serde_json::json!({
            "dealId": deal_id,
            "direction": if direction == Direction::Buy { "BUY" } else { "SELL" },
            "size": size,
            "orderType": "MARKET",
        });
        self.with_retry(|| async {
            let resp = self
                .auth_request(self.client.post(self.url("/positions/otc/close")))
                .json(&body)
                .send()
                .await
                .map_err(|e| BrokerError::Transport(e.to_string()))?;
            let status = resp.status();
            let raw: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| BrokerError::Api(e.to_string()))?;
            if !status.is_success() {
                return Err(Self::classify_status(status, &raw.to_string()));
            }
            Ok(parse_ack(&deal_reference, raw))
        })
        .await
    }

    async fn get_working_orders(&self) -> Result<Vec<WorkingOrder>, BrokerError> {
        self.with_retry(|| async {
            let resp = self
                .auth_request(self.client.get(self.url("/workingorders")))
                .send()
                .await
                .map_err(|e| BrokerError::Transport(e.to_string()))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::classify_status(status, &body));
            }
            resp.json::<Vec<WorkingOrder>>()
                .await
                .map_err(|e| BrokerError::Api(e.to_string()))
        })
        .await
    }

    async fn cancel_working_order(&self, deal_id: &str) -> Result<(), BrokerError> {
        self.with_retry(|| async {
            let resp = self
                .auth_request(
                    self.client
                        .delete(self.url(&format!("/workingorders/otc/{deal_id}"))),
                )
                .send()
                .await
                .map_err(|e| BrokerError::Transport(e.to_string()))?;
            if resp.status().is_success() {
                Ok(())
            } else {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Err(Self::classify_status(status, &body))
            }
        })
        .await
    }

    async fn get_market_details(&self, epic: &str) -> Result<MarketDetails, BrokerError> {
        self.with_retry(|| async {
            let resp = self
                .auth_request(self.client.get(self.url(&format!("/markets/{epic}"))))
                .send()
                .await
                .map_err(|e| BrokerError::Transport(e.to_string()))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::classify_status(status, &body));
            }
            resp.json::<MarketDetails>()
                .await
                .map_err(|e| BrokerError::Api(e.to_string()))
        })
        .await
    }
}

fn parse_ack(deal_reference: &str, raw: serde_json::Value) -> OrderAck {
    let status_raw = raw
        .get("dealStatus")
        .and_then(|v| v.as_str())
        .unwrap_or("PENDING")
        .to_string();
    let deal_status = match status_raw.as_str() {
        "ACCEPTED" => Some(DealStatus::Accepted),
        "REJECTED" => Some(DealStatus::Rejected),
        _ => Some(DealStatus::Pending),
    };
    let deal_id = raw
        .get("dealId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let rejection_reason = raw
        .get("reason")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    OrderAck {
        deal_reference: deal_reference.to_string(),
        deal_id,
        deal_status,
        status_raw,
        rejection_reason,
        raw,
    }
}
