//! Chain gateway ("gate") client.
//!
//! The pipeline needs two things from the network: the data required to
//! build a transaction for an address, and a way to submit the signed bytes.

use async_trait::async_trait;
use ledgerbridge_core::Address;
use serde_json::Value;
use std::time::Duration;

/// Coin id of the base coin, used to pay gas.
pub const BASE_COIN_ID: u64 = 0;

/// Everything needed to build a transaction for one address.
#[derive(Debug, Clone, PartialEq)]
pub struct TxInitData {
    /// Next nonce (current transaction count + 1).
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_coin_id: u64,
    /// Fee table as returned by the gate.
    pub commissions: Value,
}

/// Terminal result of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Ok { hash: String },
    Error { code: i64, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("gate request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gate returned an unexpected response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait GateRepository: Send + Sync {
    async fn tx_init_data(&self, address: &Address) -> Result<TxInitData, GateError>;

    /// Submit hex-encoded signed transaction bytes.
    async fn send_tx(&self, signed_tx: &str) -> Result<SendOutcome, GateError>;
}

/// [`GateRepository`] over the gate's HTTP JSON API.
pub struct HttpGateRepository {
    base_url: String,
    client: reqwest::Client,
}

impl HttpGateRepository {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ledgerbridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get_json(&self, path: &str) -> Result<Value, GateError> {
        let response = self.client.get(self.url(path)).send().await?;
        Ok(response.error_for_status()?.json::<Value>().await?)
    }
}

#[async_trait]
impl GateRepository for HttpGateRepository {
    async fn tx_init_data(&self, address: &Address) -> Result<TxInitData, GateError> {
        let nonce_path = format!("nonce/{address}");
        let (gas, nonce, commissions) = tokio::try_join!(
            self.get_json("min_gas_price"),
            self.get_json(&nonce_path),
            self.get_json("price_commissions"),
        )?;
        let init = TxInitData {
            nonce: parse_count(&nonce)? + 1,
            gas_price: parse_gas(&gas)?,
            gas_coin_id: BASE_COIN_ID,
            commissions,
        };
        tracing::debug!(%address, nonce = init.nonce, gas_price = init.gas_price, "fetched tx init data");
        Ok(init)
    }

    async fn send_tx(&self, signed_tx: &str) -> Result<SendOutcome, GateError> {
        let response = self
            .client
            .post(self.url("send_transaction"))
            .json(&serde_json::json!({ "tx": signed_tx }))
            .send()
            .await?;
        let status = response.status();
        let body = response.json::<Value>().await?;
        let outcome = parse_send_outcome(&body, status.as_u16())?;
        tracing::info!(?outcome, "transaction submitted");
        Ok(outcome)
    }
}

/// Integers arrive either as JSON numbers or decimal strings.
fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn field<'a>(body: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| body.get(key))
}

fn parse_count(body: &Value) -> Result<u64, GateError> {
    field(body, &["nonce", "count"])
        .and_then(as_u64)
        .ok_or_else(|| GateError::Malformed(format!("no nonce in {body}")))
}

fn parse_gas(body: &Value) -> Result<u64, GateError> {
    field(body, &["min_gas_price", "gas"])
        .and_then(as_u64)
        .ok_or_else(|| GateError::Malformed(format!("no gas price in {body}")))
}

fn parse_send_outcome(body: &Value, http_status: u16) -> Result<SendOutcome, GateError> {
    if let Some(error) = body.get("error") {
        return Ok(SendOutcome::Error {
            code: error.get("code").and_then(as_i64).unwrap_or(i64::from(http_status)),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    match body.get("hash").and_then(Value::as_str) {
        Some(hash) => Ok(SendOutcome::Ok {
            hash: hash.to_string(),
        }),
        None => Err(GateError::Malformed(format!(
            "no hash in send response (HTTP {http_status}): {body}"
        ))),
    }
}
