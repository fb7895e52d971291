//! MEXC spot REST gateway.
//!
//! Signed endpoints follow the exchange's scheme: the query string
//! (including a millisecond timestamp) is HMAC-SHA256 signed with the API
//! secret, hex encoded, and appended as `signature`; the API key travels in
//! the `X-MEXC-APIKEY` header.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

use crate::config::GatewayConfig;
use crate::domain::{OrderAck, OrderReport, OrderSide, OrderStatus, SymbolFilters};
use crate::error::{GatewayError, MartiError, Result};
use crate::exchange::ExchangeGateway;

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: &str = "5000";

pub struct MexcClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

fn payload(message: impl Into<String>) -> MartiError {
    MartiError::Gateway(GatewayError::Payload(message.into()))
}

impl MexcClient {
    pub fn new(config: &GatewayConfig, api_key: String, api_secret: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(GatewayError::Network)?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            api_secret,
        })
    }

    /// Credential-less client for the public market-data endpoints.
    pub fn public(config: &GatewayConfig) -> Result<Self> {
        Self::new(config, String::new(), String::new())
    }

    /// Build a client with credentials from `MEXC_API_KEY` / `MEXC_API_SECRET`.
    pub fn from_env(config: &GatewayConfig) -> Result<Self> {
        let api_key = std::env::var("MEXC_API_KEY")
            .map_err(|_| MartiError::Validation("MEXC_API_KEY is not set".into()))?;
        let api_secret = std::env::var("MEXC_API_SECRET")
            .map_err(|_| MartiError::Validation("MEXC_API_SECRET is not set".into()))?;
        Self::new(config, api_key, api_secret)
    }

    fn sign(&self, query: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|_| MartiError::Validation("invalid API secret".into()))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn public_get(&self, path: &str, params: &[(&str, String)]) -> Result<Value> {
        let query = encode_query(params);
        let url = if query.is_empty() {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}{path}?{query}", self.base_url)
        };
        debug!(%path, "public request");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(GatewayError::Network)?;
        parse_response(response).await
    }

    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<Value> {
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        let query = encode_query(&params);
        let signature = self.sign(&query)?;
        let url = format!("{}{path}?{query}&signature={signature}", self.base_url);
        debug!(%path, %method, "signed request");
        let response = self
            .http
            .request(method, url)
            .header("X-MEXC-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(GatewayError::Network)?;
        parse_response(response).await
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        qty: Decimal,
    ) -> Result<OrderAck> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", qty.normalize().to_string()),
            ("price", price.normalize().to_string()),
        ];
        let value = self
            .signed_request(Method::POST, "/api/v3/order", params)
            .await?;
        parse_order_ack(&value)
    }
}

fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

async fn parse_response(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body = response.text().await.map_err(GatewayError::Network)?;
    if !status.is_success() {
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("msg")
                    .or_else(|| v.get("message"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or(body);
        return Err(GatewayError::Http {
            status: status.as_u16(),
            message,
        }
        .into());
    }
    serde_json::from_str(&body)
        .map_err(|err| payload(format!("invalid JSON response: {err}")))
}

fn decimal_value(raw: &Value) -> Option<Decimal> {
    match raw {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

fn decimal_field(value: &Value, field: &str) -> Result<Decimal> {
    value
        .get(field)
        .and_then(decimal_value)
        .ok_or_else(|| payload(format!("missing or malformed field `{field}`")))
}

/// The exchange reports order ids as numbers or strings depending on the
/// endpoint; normalize to a string.
fn order_id_field(value: &Value) -> Result<String> {
    match value.get("orderId") {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(payload("missing field `orderId`")),
    }
}

fn status_field(value: &Value) -> Result<OrderStatus> {
    match value.get("status").and_then(Value::as_str) {
        Some(raw) => raw
            .parse()
            .map_err(|_| payload(format!("unknown order status `{raw}`"))),
        // Placement acks may omit the status; a new order rests on the book.
        None => Ok(OrderStatus::New),
    }
}

fn parse_order_ack(value: &Value) -> Result<OrderAck> {
    Ok(OrderAck {
        order_id: order_id_field(value)?,
        status: status_field(value)?,
    })
}

fn parse_order_report(value: &Value) -> Result<OrderReport> {
    Ok(OrderReport {
        status: status_field(value)?,
        executed_qty: decimal_field(value, "executedQty")?,
        executed_quote: decimal_field(value, "cummulativeQuoteQty")?,
    })
}

fn parse_filters(value: &Value) -> Result<SymbolFilters> {
    let info = value
        .get("symbols")
        .and_then(Value::as_array)
        .and_then(|symbols| symbols.first())
        .ok_or_else(|| payload("exchangeInfo returned no symbols"))?;

    let mut price_step = None;
    let mut qty_step = None;
    if let Some(filters) = info.get("filters").and_then(Value::as_array) {
        for filter in filters {
            match filter.get("filterType").and_then(Value::as_str) {
                Some("PRICE_FILTER") => price_step = filter.get("tickSize").and_then(decimal_value),
                Some("LOT_SIZE") => qty_step = filter.get("stepSize").and_then(decimal_value),
                _ => {}
            }
        }
    }
    // Some listings carry no filters array and expose precisions instead.
    let price_step = match price_step {
        Some(step) => step,
        None => step_from_precision(info, "quotePrecision")?,
    };
    let qty_step = match qty_step {
        Some(step) => step,
        None => step_from_precision(info, "baseAssetPrecision")?,
    };
    Ok(SymbolFilters {
        price_step,
        qty_step,
    })
}

fn step_from_precision(info: &Value, field: &str) -> Result<Decimal> {
    let digits = info
        .get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| payload(format!("missing field `{field}`")))?;
    Ok(Decimal::new(1, digits as u32))
}

fn parse_balances(value: &Value) -> Result<HashMap<String, Decimal>> {
    let entries = value
        .get("balances")
        .and_then(Value::as_array)
        .ok_or_else(|| payload("account response has no balances"))?;
    let mut balances = HashMap::with_capacity(entries.len());
    for entry in entries {
        let asset = entry
            .get("asset")
            .and_then(Value::as_str)
            .ok_or_else(|| payload("balance entry without asset"))?;
        balances.insert(asset.to_string(), decimal_field(entry, "free")?);
    }
    Ok(balances)
}

/// Klines come as arrays; index 4 is the close.
fn parse_klines(value: &Value) -> Result<Vec<Decimal>> {
    let rows = value
        .as_array()
        .ok_or_else(|| payload("klines response is not an array"))?;
    rows.iter()
        .map(|row| {
            row.get(4)
                .and_then(decimal_value)
                .ok_or_else(|| payload("kline row without a close price"))
        })
        .collect()
}

#[async_trait]
impl ExchangeGateway for MexcClient {
    async fn get_price(&self, symbol: &str) -> Result<Decimal> {
        let value = self
            .public_get("/api/v3/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        decimal_field(&value, "price")
    }

    async fn get_exchange_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        let value = self
            .public_get("/api/v3/exchangeInfo", &[("symbol", symbol.to_string())])
            .await?;
        parse_filters(&value)
    }

    async fn get_account_balances(&self) -> Result<HashMap<String, Decimal>> {
        let value = self
            .signed_request(Method::GET, "/api/v3/account", Vec::new())
            .await?;
        parse_balances(&value)
    }

    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Decimal>> {
        let value = self
            .public_get(
                "/api/v3/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        parse_klines(&value)
    }

    async fn place_limit_buy(
        &self,
        symbol: &str,
        price: Decimal,
        qty: Decimal,
    ) -> Result<OrderAck> {
        self.place_order(symbol, OrderSide::Buy, price, qty).await
    }

    async fn place_limit_sell(
        &self,
        symbol: &str,
        price: Decimal,
        qty: Decimal,
    ) -> Result<OrderAck> {
        self.place_order(symbol, OrderSide::Sell, price, qty).await
    }

    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<OrderReport> {
        let value = self
            .signed_request(
                Method::GET,
                "/api/v3/order",
                vec![
                    ("symbol", symbol.to_string()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await?;
        parse_order_report(&value)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<bool> {
        self.signed_request(
            Method::DELETE,
            "/api/v3/order",
            vec![
                ("symbol", symbol.to_string()),
                ("orderId", order_id.to_string()),
            ],
        )
        .await?;
        Ok(true)
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<usize> {
        let value = self
            .signed_request(
                Method::GET,
                "/api/v3/openOrders",
                vec![("symbol", symbol.to_string())],
            )
            .await?;
        let open = value
            .as_array()
            .ok_or_else(|| payload("openOrders response is not an array"))?;

        let mut cancelled = 0;
        for order in open {
            let order_id = order_id_field(order)?;
            match self.cancel_order(symbol, &order_id).await {
                Ok(_) => cancelled += 1,
                Err(err) => {
                    debug!(%order_id, error = %err, "cancel failed, continuing");
                }
            }
        }
        Ok(cancelled)
    }
}
