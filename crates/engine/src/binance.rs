use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::debug;

use common::{
    AccountMargin, Candle, CloseReceipt, Error, Exchange, PositionSide, PositionSnapshot, Result,
    SymbolFilters,
};

const LIVE_URL: &str = "https://fapi.binance.com";
const TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// Minimum spacing between REST calls, enforced globally across all tasks.
const MIN_CALL_SPACING: Duration = Duration::from_millis(100);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Signed REST client for Binance USD-M futures.
///
/// All requests serialize through an internal pacing lock. A failed call is
/// classified transient or permanent and returned to the caller, which
/// retries on its next tick — no internal retries.
pub struct BinanceFuturesClient {
    api_key: String,
    secret: String,
    base_url: String,
    http: Client,
    last_call: Mutex<Option<Instant>>,
}

impl BinanceFuturesClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: if testnet { TESTNET_URL } else { LIVE_URL }.to_string(),
            http: Client::builder()
                .use_rustls_tls()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
            last_call: Mutex::new(None),
        }
    }

    /// Hold the pacing lock until at least `MIN_CALL_SPACING` since the
    /// previous request started. Callers on other tasks queue behind it.
    async fn pace(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let wait = MIN_CALL_SPACING.saturating_sub(prev.elapsed());
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_millis() as u64
    }

    fn sign(&self, query: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn signed_get(&self, path: &str, params: &str) -> Result<String> {
        self.pace().await;
        let ts = Self::timestamp_ms();
        let query = if params.is_empty() {
            format!("timestamp={ts}")
        } else {
            format!("{params}&timestamp={ts}")
        };
        let signature = self.sign(&query);
        let url = format!("{}{path}?{query}&signature={signature}", self.base_url);

        let resp = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(classify_reqwest)?;
        read_body(resp).await
    }

    async fn signed_post(&self, path: &str, params: &str) -> Result<String> {
        self.pace().await;
        let ts = Self::timestamp_ms();
        let query = format!("{params}&timestamp={ts}");
        let signature = self.sign(&query);
        let body = format!("{query}&signature={signature}");
        let url = format!("{}{path}", self.base_url);

        let resp = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(classify_reqwest)?;
        read_body(resp).await
    }

    async fn public_get(&self, path: &str, query: &str) -> Result<String> {
        self.pace().await;
        let url = if query.is_empty() {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}{path}?{query}", self.base_url)
        };
        let resp = self.http.get(&url).send().await.map_err(classify_reqwest)?;
        read_body(resp).await
    }
}

#[async_trait]
impl Exchange for BinanceFuturesClient {
    async fn open_positions(&self) -> Result<Vec<PositionSnapshot>> {
        let body = self.signed_get("/fapi/v2/positionRisk", "").await?;
        let rows: Vec<PositionRiskRow> =
            serde_json::from_str(&body).map_err(|e| Error::PermanentExchange(e.to_string()))?;

        let mut positions = Vec::new();
        for row in rows {
            let amt = parse_f64(&row.position_amt, "positionAmt")?;
            if amt == 0.0 {
                continue;
            }
            positions.push(PositionSnapshot {
                symbol: row.symbol,
                side: if amt > 0.0 {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                },
                quantity: amt.abs(),
                entry_price: parse_f64(&row.entry_price, "entryPrice")?,
                leverage: row.leverage.parse().unwrap_or(1),
                unrealized_pnl: parse_f64(&row.un_realized_profit, "unRealizedProfit")?,
                liquidation_price: parse_f64(&row.liquidation_price, "liquidationPrice")?,
            });
        }
        debug!(count = positions.len(), "open positions fetched");
        Ok(positions)
    }

    async fn current_price(&self, symbol: &str) -> Result<f64> {
        let body = self
            .public_get("/fapi/v1/ticker/price", &format!("symbol={symbol}"))
            .await?;
        let ticker: PriceTicker =
            serde_json::from_str(&body).map_err(|e| Error::PermanentExchange(e.to_string()))?;
        parse_f64(&ticker.price, "price")
    }

    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let body = self
            .public_get(
                "/fapi/v1/klines",
                &format!("symbol={symbol}&interval={interval}&limit={limit}"),
            )
            .await?;
        let rows: Vec<serde_json::Value> =
            serde_json::from_str(&body).map_err(|e| Error::PermanentExchange(e.to_string()))?;

        rows.iter().map(parse_kline_row).collect()
    }

    async fn close_position(
        &self,
        symbol: &str,
        quantity: f64,
        side: PositionSide,
        reason: &str,
    ) -> Result<CloseReceipt> {
        // The close must never exceed what is actually open, so read the
        // live quantity first and clamp.
        let open = self.open_positions().await?;
        let Some(position) = open.iter().find(|p| p.symbol == symbol) else {
            return Err(Error::Validation(format!(
                "no open position for {symbol} on the exchange"
            )));
        };
        let clamped = quantity.min(position.quantity);

        let client_order_id = uuid::Uuid::new_v4().simple().to_string();
        let params = format!(
            "symbol={symbol}&side={}&type=MARKET&quantity={}&reduceOnly=true&newClientOrderId={client_order_id}",
            side.closing_order_side(),
            format_quantity(clamped),
        );

        debug!(symbol, qty = clamped, reason, "submitting reduce-only close");
        let body = self.signed_post("/fapi/v1/order", &params).await?;
        let resp: OrderResponse =
            serde_json::from_str(&body).map_err(|e| Error::PermanentExchange(e.to_string()))?;

        Ok(CloseReceipt {
            order_id: resp.order_id.to_string(),
            executed_qty: resp
                .executed_qty
                .as_deref()
                .and_then(|q| q.parse::<f64>().ok())
                .unwrap_or(clamped),
        })
    }

    async fn account_margin(&self) -> Result<AccountMargin> {
        let body = self.signed_get("/fapi/v2/account", "").await?;
        let account: AccountResponse =
            serde_json::from_str(&body).map_err(|e| Error::PermanentExchange(e.to_string()))?;

        let wallet_balance = parse_f64(&account.total_wallet_balance, "totalWalletBalance")?;
        let margin_balance = parse_f64(&account.total_margin_balance, "totalMarginBalance")?;
        let available_balance = parse_f64(&account.available_balance, "availableBalance")?;
        let unrealized_pnl = parse_f64(&account.total_unrealized_profit, "totalUnrealizedProfit")?;

        let margin_ratio = if margin_balance > 0.0 {
            (margin_balance - available_balance) / margin_balance
        } else {
            0.0
        };

        Ok(AccountMargin {
            wallet_balance,
            margin_balance,
            available_balance,
            unrealized_pnl,
            margin_ratio,
        })
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        let body = self
            .public_get("/fapi/v1/exchangeInfo", &format!("symbol={symbol}"))
            .await?;
        let info: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| Error::PermanentExchange(e.to_string()))?;

        let mut filters = SymbolFilters::default();
        let Some(rows) = info
            .get("symbols")
            .and_then(|s| s.as_array())
            .and_then(|arr| arr.first())
            .and_then(|sym| sym.get("filters"))
            .and_then(|f| f.as_array())
        else {
            return Ok(filters);
        };

        for row in rows {
            match row.get("filterType").and_then(|t| t.as_str()) {
                Some("LOT_SIZE") => {
                    filters.min_qty = field_f64(row, "minQty");
                    filters.step_size = field_f64(row, "stepSize");
                }
                Some("MIN_NOTIONAL") => {
                    // USD-M futures call the field "notional".
                    let value = field_f64(row, "notional");
                    filters.min_notional = if value > 0.0 {
                        value
                    } else {
                        field_f64(row, "minNotional")
                    };
                }
                _ => {}
            }
        }
        Ok(filters)
    }
}

fn classify_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() {
        Error::TransientExchange(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Map the HTTP status onto the error taxonomy: 5xx and rate limits are
/// transient, the rest of 4xx is permanent.
async fn read_body(resp: reqwest::Response) -> Result<String> {
    let status = resp.status();
    let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
    if status.is_success() {
        return Ok(body);
    }
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.as_u16() == 418
    {
        Err(Error::TransientExchange(format!("HTTP {status}: {body}")))
    } else {
        Err(Error::PermanentExchange(format!("HTTP {status}: {body}")))
    }
}

fn parse_f64(s: &str, field: &str) -> Result<f64> {
    s.parse()
        .map_err(|_| Error::PermanentExchange(format!("unparseable {field}: '{s}'")))
}

fn field_f64(row: &serde_json::Value, key: &str) -> f64 {
    row.get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0)
}

/// Plain decimal rendering without trailing zeros; Binance rejects
/// scientific notation in the quantity field.
fn format_quantity(qty: f64) -> String {
    let s = format!("{qty:.8}");
    let trimmed = s.trim_end_matches('0').trim_end_matches('.');
    trimmed.to_string()
}

fn parse_kline_row(row: &serde_json::Value) -> Result<Candle> {
    let arr = row
        .as_array()
        .ok_or_else(|| Error::PermanentExchange("kline row is not an array".into()))?;
    if arr.len() < 6 {
        return Err(Error::PermanentExchange("kline row too short".into()));
    }

    let open_time_ms = arr[0]
        .as_i64()
        .ok_or_else(|| Error::PermanentExchange("kline open time is not an integer".into()))?;
    let open_time = Utc
        .timestamp_millis_opt(open_time_ms)
        .single()
        .ok_or_else(|| Error::PermanentExchange("kline open time out of range".into()))?;

    let num = |idx: usize, field: &str| -> Result<f64> {
        arr[idx]
            .as_str()
            .ok_or_else(|| Error::PermanentExchange(format!("kline {field} is not a string")))
            .and_then(|s| parse_f64(s, field))
    };

    Ok(Candle {
        open_time,
        open: num(1, "open")?,
        high: num(2, "high")?,
        low: num(3, "low")?,
        close: num(4, "close")?,
        volume: num(5, "volume")?,
    })
}

// ─── Response types ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRiskRow {
    symbol: String,
    position_amt: String,
    entry_price: String,
    #[serde(default)]
    leverage: String,
    un_realized_profit: String,
    liquidation_price: String,
}

#[derive(Deserialize)]
struct PriceTicker {
    price: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    executed_qty: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountResponse {
    total_wallet_balance: String,
    total_margin_balance: String,
    available_balance: String,
    total_unrealized_profit: String,
}
