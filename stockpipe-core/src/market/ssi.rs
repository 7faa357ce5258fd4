//! SSI FastConnect Data client.
//!
//! Obtains a bearer token from `api/v2/Market/AccessToken`, caches it until
//! the API answers 401, and pages through `Securities` and `DailyOhlc`.
//! Transient failures are retried with exponential backoff, never sooner than
//! the cool-down or a 429's `Retry-After`; HTTP 403 trips the circuit
//! breaker. The token request is followed by the cool-down as well.
//!
//! Response bodies are parsed leniently: keys are accepted in camelCase or
//! PascalCase and numeric fields may arrive as JSON numbers or strings.

use super::circuit_breaker::CircuitBreaker;
use super::pacing::{Pacer, DEFAULT_COOL_DOWN};
use super::provider::{
    ApiError, DailyBar, DailyOhlcRequest, MarketDataApi, Page, SecuritiesRequest, SecurityListing,
};
use chrono::NaiveDate;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_BASE_URL: &str = "https://fc-data.ssi.com.vn/";

const TOKEN_PATH: &str = "api/v2/Market/AccessToken";
const SECURITIES_PATH: &str = "api/v2/Market/Securities";
const DAILY_OHLC_PATH: &str = "api/v2/Market/DailyOhlc";

/// `dd/MM/yyyy`, the API's date format.
const DATE_FORMAT: &str = "%d/%m/%Y";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SsiSettings {
    pub base_url: String,
    pub consumer_id: String,
    pub consumer_secret: String,
}

impl Default for SsiSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            consumer_id: String::new(),
            consumer_secret: String::new(),
        }
    }
}

// ── Wire format ─────────────────────────────────────────────────────

mod lenient {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Null => String::new(),
            Value::String(s) => s,
            other => other.to_string(),
        })
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let s = string(d)?;
        let s = s.trim();
        Ok(if s.is_empty() { None } else { Some(s.to_string()) })
    }

    fn number<E: Error>(value: Value) -> Result<Option<f64>, E> {
        match value {
            Value::Null => Ok(None),
            Value::Number(n) => n
                .as_f64()
                .map(Some)
                .ok_or_else(|| E::custom(format!("number out of range: {n}"))),
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::String(s) => s
                .trim()
                .replace(',', "")
                .parse::<f64>()
                .map(Some)
                .map_err(|_| E::custom(format!("not a number: {s:?}"))),
            other => Err(E::custom(format!("not a number: {other}"))),
        }
    }

    pub fn f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        number::<D::Error>(Value::deserialize(d)?)?.ok_or_else(|| D::Error::custom("missing number"))
    }

    pub fn f64_or_zero<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(number::<D::Error>(Value::deserialize(d)?)?.unwrap_or(0.0))
    }

    pub fn i64_or_zero<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        Ok(number::<D::Error>(Value::deserialize(d)?)?.map_or(0, |v| v as i64))
    }

    pub fn opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        Ok(number::<D::Error>(Value::deserialize(d)?)?.map(|v| v as i64))
    }

    pub fn u64_or_zero<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        Ok(number::<D::Error>(Value::deserialize(d)?)?.map_or(0, |v| v.max(0.0) as u64))
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default, alias = "Message", deserialize_with = "lenient::string")]
    message: String,
    #[serde(default, alias = "Status", deserialize_with = "lenient::string")]
    status: String,
    #[serde(
        default,
        rename = "totalRecord",
        alias = "TotalRecord",
        deserialize_with = "lenient::u64_or_zero"
    )]
    total_record: u64,
    #[serde(alias = "Data")]
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn is_success(&self) -> bool {
        self.status == "200" || self.status.eq_ignore_ascii_case("success")
    }
}

#[derive(Debug, Deserialize)]
struct TokenData {
    #[serde(rename = "accessToken", alias = "AccessToken")]
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecurityItem {
    #[serde(default, alias = "Market", deserialize_with = "lenient::string")]
    market: String,
    #[serde(alias = "Symbol")]
    symbol: String,
    #[serde(default, alias = "StockName", deserialize_with = "lenient::opt_string")]
    stock_name: Option<String>,
    #[serde(default, alias = "StockEnName", deserialize_with = "lenient::opt_string")]
    stock_en_name: Option<String>,
    #[serde(
        default,
        rename = "secType",
        alias = "SecType",
        deserialize_with = "lenient::opt_string"
    )]
    sec_type: Option<String>,
    #[serde(default, alias = "ListedShare", deserialize_with = "lenient::opt_i64")]
    listed_share: Option<i64>,
    #[serde(
        default,
        alias = "MarketCapitalization",
        deserialize_with = "lenient::opt_i64"
    )]
    market_capitalization: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OhlcItem {
    #[serde(alias = "Symbol")]
    symbol: String,
    #[serde(default, alias = "Market", deserialize_with = "lenient::string")]
    market: String,
    #[serde(alias = "TradingDate")]
    trading_date: String,
    #[serde(alias = "Open", deserialize_with = "lenient::f64")]
    open: f64,
    #[serde(alias = "High", deserialize_with = "lenient::f64")]
    high: f64,
    #[serde(alias = "Low", deserialize_with = "lenient::f64")]
    low: f64,
    #[serde(alias = "Close", deserialize_with = "lenient::f64")]
    close: f64,
    #[serde(default, alias = "Volume", deserialize_with = "lenient::i64_or_zero")]
    volume: i64,
    #[serde(default, alias = "Value", deserialize_with = "lenient::f64_or_zero")]
    value: f64,
}

fn parse_trading_date(raw: &str) -> Result<NaiveDate, ApiError> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .or_else(|_| NaiveDate::parse_from_str(raw.get(..10).unwrap_or(raw), "%Y-%m-%d"))
        .map_err(|_| ApiError::ResponseFormatChanged(format!("unrecognised trading date {raw:?}")))
}

fn parse_envelope<T: DeserializeOwned>(path: &str, body: &str) -> Result<Envelope<Vec<T>>, ApiError> {
    let envelope: Envelope<Vec<T>> = serde_json::from_str(body)
        .map_err(|e| ApiError::ResponseFormatChanged(format!("{path}: {e}")))?;
    if !envelope.is_success() {
        return Err(ApiError::Rejected {
            status: envelope.status,
            message: envelope.message,
        });
    }
    Ok(envelope)
}

/// Parse a `Securities` response body.
pub fn parse_securities(body: &str) -> Result<Page<SecurityListing>, ApiError> {
    let envelope = parse_envelope::<SecurityItem>(SECURITIES_PATH, body)?;
    let data = envelope
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|item| SecurityListing {
            market: item.market,
            symbol: item.symbol.trim().to_string(),
            name: item.stock_name,
            en_name: item.stock_en_name,
            security_type: item.sec_type,
            listed_share: item.listed_share,
            market_capitalization: item.market_capitalization,
        })
        .collect();
    Ok(Page {
        message: envelope.message,
        status: envelope.status,
        total_record: envelope.total_record,
        data,
    })
}

/// Parse a `DailyOhlc` response body.
pub fn parse_daily_ohlc(body: &str) -> Result<Page<DailyBar>, ApiError> {
    let envelope = parse_envelope::<OhlcItem>(DAILY_OHLC_PATH, body)?;
    let data = envelope
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|item| -> Result<DailyBar, ApiError> {
            Ok(DailyBar {
                trading_date: parse_trading_date(&item.trading_date)?,
                symbol: item.symbol,
                market: item.market,
                open: item.open,
                high: item.high,
                low: item.low,
                close: item.close,
                volume: item.volume,
                value: item.value,
            })
        })
        .collect::<Result<Vec<_>, ApiError>>()?;
    Ok(Page {
        message: envelope.message,
        status: envelope.status,
        total_record: envelope.total_record,
        data,
    })
}

pub fn securities_query(request: &SecuritiesRequest) -> Vec<(&'static str, String)> {
    let mut query = Vec::with_capacity(3);
    if let Some(market) = &request.market {
        query.push(("market", market.clone()));
    }
    query.push(("pageIndex", request.page.index.to_string()));
    query.push(("pageSize", request.page.size.to_string()));
    query
}

pub fn daily_ohlc_query(request: &DailyOhlcRequest) -> Vec<(&'static str, String)> {
    vec![
        ("symbol", request.symbol.clone()),
        ("fromDate", request.from.format(DATE_FORMAT).to_string()),
        ("toDate", request.to.format(DATE_FORMAT).to_string()),
        ("pageIndex", request.page.index.to_string()),
        ("pageSize", request.page.size.to_string()),
        ("ascending", request.ascending.to_string()),
    ]
}

// ── Client ──────────────────────────────────────────────────────────

pub struct SsiClient {
    client: Client,
    settings: SsiSettings,
    token: Mutex<Option<String>>,
    circuit_breaker: Arc<CircuitBreaker>,
    pacer: Arc<dyn Pacer>,
    cool_down: Duration,
    max_retries: u32,
    base_delay: Duration,
}

impl SsiClient {
    pub fn new(
        settings: SsiSettings,
        circuit_breaker: Arc<CircuitBreaker>,
        pacer: Arc<dyn Pacer>,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ApiError::Other(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            settings,
            token: Mutex::new(None),
            circuit_breaker,
            pacer,
            cool_down: DEFAULT_COOL_DOWN,
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        })
    }

    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    /// Minimum pause after the token request and before any retry.
    pub fn with_cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down = cool_down;
        self
    }

    /// Pause before retry `attempt` (1-based).
    fn retry_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        backoff
            .max(self.cool_down)
            .max(retry_after.unwrap_or(Duration::ZERO))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.settings.base_url.trim_end_matches('/'))
    }

    fn token_slot(&self) -> MutexGuard<'_, Option<String>> {
        self.token.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn access_token(&self) -> Result<String, ApiError> {
        if let Some(token) = self.token_slot().clone() {
            return Ok(token);
        }
        let token = self.request_token();
        self.pacer.pause(self.cool_down);
        let token = token?;
        *self.token_slot() = Some(token.clone());
        Ok(token)
    }

    fn request_token(&self) -> Result<String, ApiError> {
        self.circuit_breaker.guard()?;
        let body = json!({
            "consumerID": self.settings.consumer_id,
            "consumerSecret": self.settings.consumer_secret,
        });
        let resp = self
            .client
            .post(self.endpoint(TOKEN_PATH))
            .json(&body)
            .send()
            .map_err(|e| ApiError::NetworkUnreachable(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::FORBIDDEN {
            self.circuit_breaker.trip();
            return Err(ApiError::CircuitBreakerTripped);
        }
        if !status.is_success() {
            return Err(ApiError::AuthenticationFailed(format!(
                "HTTP {status} from {TOKEN_PATH}"
            )));
        }
        let text = resp
            .text()
            .map_err(|e| ApiError::NetworkUnreachable(e.to_string()))?;
        let envelope: Envelope<TokenData> = serde_json::from_str(&text)
            .map_err(|e| ApiError::ResponseFormatChanged(format!("{TOKEN_PATH}: {e}")))?;
        match envelope.data {
            Some(data) if envelope.is_success() && !data.access_token.is_empty() => {
                info!("obtained SSI access token");
                Ok(data.access_token)
            }
            _ => Err(ApiError::AuthenticationFailed(format!(
                "status {}: {}",
                envelope.status, envelope.message
            ))),
        }
    }

    /// GET `path` with retries; returns the response body.
    fn fetch(&self, path: &str, query: &[(&'static str, String)]) -> Result<String, ApiError> {
        self.circuit_breaker.guard()?;

        let url = self.endpoint(path);
        let mut last_error = None;
        let mut refreshed = false;
        let mut retry_after = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.retry_delay(attempt, retry_after.take());
                debug!(path, attempt, ?delay, "retrying request");
                self.pacer.pause(delay);
            }
            self.circuit_breaker.guard()?;

            let token = self.access_token()?;
            let resp = match self.client.get(&url).query(query).bearer_auth(&token).send() {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    self.circuit_breaker.record_failure();
                    last_error = Some(ApiError::NetworkUnreachable(e.to_string()));
                    continue;
                }
                Err(e) => return Err(ApiError::NetworkUnreachable(e.to_string())),
            };

            let status = resp.status();
            if status == StatusCode::FORBIDDEN {
                self.circuit_breaker.trip();
                return Err(ApiError::CircuitBreakerTripped);
            }
            if status == StatusCode::UNAUTHORIZED {
                if refreshed {
                    return Err(ApiError::AuthenticationFailed(
                        "access token rejected after refresh".into(),
                    ));
                }
                warn!(path, "access token rejected; requesting a new one");
                *self.token_slot() = None;
                refreshed = true;
                last_error = Some(ApiError::AuthenticationFailed("access token expired".into()));
                continue;
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                self.circuit_breaker.record_failure();
                let wait_secs = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .unwrap_or(60);
                warn!(path, retry_after_secs = wait_secs, "rate limited");
                retry_after = Some(Duration::from_secs(wait_secs));
                last_error = Some(ApiError::RateLimited {
                    retry_after_secs: wait_secs,
                });
                continue;
            }
            if status.is_server_error() {
                self.circuit_breaker.record_failure();
                last_error = Some(ApiError::Other(format!("HTTP {status} from {path}")));
                continue;
            }
            if !status.is_success() {
                return Err(ApiError::Rejected {
                    status: status.as_u16().to_string(),
                    message: resp.text().unwrap_or_default(),
                });
            }

            let body = resp
                .text()
                .map_err(|e| ApiError::NetworkUnreachable(e.to_string()))?;
            self.circuit_breaker.record_success();
            return Ok(body);
        }

        Err(last_error.unwrap_or_else(|| ApiError::Other(format!("no attempts made for {path}"))))
    }
}

impl MarketDataApi for SsiClient {
    fn name(&self) -> &str {
        "ssi-fastconnect"
    }

    fn securities(&self, request: &SecuritiesRequest) -> Result<Page<SecurityListing>, ApiError> {
        request.page.validate()?;
        let body = self.fetch(SECURITIES_PATH, &securities_query(request))?;
        let page = parse_securities(&body)?;
        debug!(
            page = request.page.index,
            rows = page.data.len(),
            total = page.total_record,
            "securities page"
        );
        Ok(page)
    }

    fn daily_ohlc(&self, request: &DailyOhlcRequest) -> Result<Page<DailyBar>, ApiError> {
        request.validate()?;
        let body = self.fetch(DAILY_OHLC_PATH, &daily_ohlc_query(request))?;
        let page = parse_daily_ohlc(&body)?;
        debug!(
            symbol = %request.symbol,
            page = request.page.index,
            rows = page.data.len(),
            total = page.total_record,
            "daily ohlc page"
        );
        Ok(page)
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::provider::{PageRequest, PageSize};

    #[test]
    fn parses_camel_case_securities() {
        let body = r#"{"message":"Success","status":200,"totalRecord":2,
            "data":[{"market":"HOSE","symbol":"FPT","stockName":"CTCP FPT","stockEnName":"FPT Corp"},
                    {"market":"HNX","symbol":"SHS ","stockName":"","stockEnName":null}]}"#;
        let page = parse_securities(body).unwrap();
        assert_eq!(page.total_record, 2);
        assert_eq!(page.status, "200");
        assert_eq!(page.data[0].name.as_deref(), Some("CTCP FPT"));
        assert_eq!(page.data[1].symbol, "SHS");
        assert_eq!(page.data[1].name, None);
        assert_eq!(page.data[1].en_name, None);
    }

    #[test]
    fn parses_security_details_when_present() {
        let body = r#"{"message":"Success","status":200,"totalRecord":1,
            "data":[{"market":"HOSE","symbol":"FPT","secType":"ST",
                     "listedShare":"1,269,847,168","marketCapitalization":121896000000000}]}"#;
        let listing = &parse_securities(body).unwrap().data[0];
        assert_eq!(listing.security_type.as_deref(), Some("ST"));
        assert_eq!(listing.listed_share, Some(1_269_847_168));
        assert_eq!(listing.market_capitalization, Some(121_896_000_000_000));
    }

    #[test]
    fn parses_token_envelope() {
        let body = r#"{"message":"Success","status":200,"data":{"accessToken":"abc"}}"#;
        let envelope: Envelope<TokenData> = serde_json::from_str(body).unwrap();
        assert!(envelope.is_success());
        assert_eq!(envelope.data.unwrap().access_token, "abc");

        let missing: Envelope<TokenData> =
            serde_json::from_str(r#"{"message":"Unauthorized","status":401}"#).unwrap();
        assert!(missing.data.is_none());
    }

    #[test]
    fn retry_delay_never_undercuts_cool_down_or_retry_after() {
        let client = SsiClient::new(
            SsiSettings::default(),
            Arc::new(CircuitBreaker::for_market_data()),
            Arc::new(crate::market::pacing::RecordingPacer::new()),
        )
        .unwrap()
        .with_cool_down(Duration::from_millis(1100))
        .with_retries(3, Duration::from_millis(500));

        assert_eq!(client.retry_delay(1, None), Duration::from_millis(1100));
        assert_eq!(client.retry_delay(2, None), Duration::from_millis(1100));
        assert_eq!(client.retry_delay(3, None), Duration::from_millis(2000));
        assert_eq!(
            client.retry_delay(1, Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn parses_pascal_case_ohlc_with_string_numbers() {
        let body = r#"{"Message":"Success","Status":"Success","TotalRecord":"1",
            "Data":[{"Symbol":"FPT","Market":"HOSE","TradingDate":"02/01/2024","Time":null,
                     "Open":"95,000","High":"96000","Low":94500,"Close":95500,
                     "Volume":"1234567","Value":"117.5"}]}"#;
        let page = parse_daily_ohlc(body).unwrap();
        let bar = &page.data[0];
        assert_eq!(bar.trading_date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(bar.open, 95000.0);
        assert_eq!(bar.low, 94500.0);
        assert_eq!(bar.volume, 1_234_567);
        assert_eq!(bar.value, 117.5);
    }

    #[test]
    fn empty_page_has_no_data() {
        let body = r#"{"message":"Success","status":200,"totalRecord":0,"data":null}"#;
        let page = parse_daily_ohlc(body).unwrap();
        assert!(page.is_empty());
    }

    #[test]
    fn error_status_is_rejected() {
        let body = r#"{"message":"Invalid symbol","status":400,"totalRecord":0,"data":null}"#;
        assert!(matches!(
            parse_daily_ohlc(body),
            Err(ApiError::Rejected { status, .. }) if status == "400"
        ));
    }

    #[test]
    fn malformed_body_is_format_change() {
        assert!(matches!(
            parse_securities("<html>"),
            Err(ApiError::ResponseFormatChanged(_))
        ));
        let bad_date = r#"{"status":200,"totalRecord":1,"data":[{"symbol":"FPT","tradingDate":"2024/13/45",
            "open":1,"high":1,"low":1,"close":1}]}"#;
        assert!(matches!(
            parse_daily_ohlc(bad_date),
            Err(ApiError::ResponseFormatChanged(_))
        ));
    }

    #[test]
    fn ohlc_query_uses_day_first_dates() {
        let req = DailyOhlcRequest {
            page: PageRequest::page(2, PageSize::Thousand),
            symbol: "FPT".into(),
            from: NaiveDate::from_ymd_opt(2020, 2, 1).unwrap(),
            to: NaiveDate::from_ymd_opt(2020, 3, 2).unwrap(),
            ascending: true,
        };
        let query = daily_ohlc_query(&req);
        assert!(query.contains(&("fromDate", "01/02/2020".to_string())));
        assert!(query.contains(&("toDate", "02/03/2020".to_string())));
        assert!(query.contains(&("pageIndex", "2".to_string())));
        assert!(query.contains(&("pageSize", "1000".to_string())));
    }

    #[test]
    fn securities_query_omits_absent_market() {
        let req = SecuritiesRequest {
            page: PageRequest::first(PageSize::Hundred),
            market: None,
        };
        assert!(securities_query(&req).iter().all(|(k, _)| *k != "market"));
    }

    #[test]
    fn tripped_breaker_short_circuits() {
        let breaker = Arc::new(CircuitBreaker::for_market_data());
        breaker.trip();
        let client = SsiClient::new(
            SsiSettings::default(),
            breaker,
            Arc::new(crate::market::pacing::RecordingPacer::new()),
        )
        .unwrap();
        assert!(!client.is_available());
        let req = SecuritiesRequest {
            page: PageRequest::first(PageSize::Hundred),
            market: None,
        };
        assert!(matches!(
            client.securities(&req),
            Err(ApiError::CircuitBreakerTripped)
        ));
    }
}
