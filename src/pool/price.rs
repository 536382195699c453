use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

const TICKER_ENDPOINT: &str = "https://api.binance.com/api/v3/ticker/24hr";

/// 24-hour ticker snapshot for one trading pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceQuote {
    pub value: f64,
    pub change_percent: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerResponse {
    last_price: Option<String>,
    price_change_percent: Option<String>,
}

/// Symbols for a price source come from its url field, comma or
/// whitespace separated. Bare base-asset names get the USDT quote
/// appended, matching the exchange's pair naming.
pub fn parse_symbols(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split([',', ' ', '\n'])
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .map(|s| {
            if s.ends_with("USDT") {
                s
            } else {
                format!("{s}USDT")
            }
        })
        .collect()
}

/// Hour-bucketed dedupe key: one item per symbol per wall-clock hour,
/// refreshed in place on repeat fetches within the hour.
pub fn hour_bucket_id(symbol: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}", symbol, at.format("%Y-%m-%dT%H"))
}

/// Decimal places scale with magnitude so sub-cent assets stay readable.
pub fn format_price(value: f64) -> String {
    if value >= 1.0 {
        format!("{value:.2}")
    } else if value >= 0.01 {
        format!("{value:.4}")
    } else if value >= 0.0001 {
        format!("{value:.6}")
    } else {
        format!("{value:.8}")
    }
}

pub fn build_title(symbol: &str, quote: PriceQuote) -> String {
    let arrow = if quote.change_percent >= 0.0 {
        "📈"
    } else {
        "📉"
    };
    format!(
        "{} {} ${} ({}{:.2}%)",
        symbol,
        arrow,
        format_price(quote.value),
        sign(quote.change_percent),
        quote.change_percent
    )
}

pub fn build_body(symbol: &str, quote: PriceQuote, at: DateTime<Utc>) -> String {
    format!(
        "{} 当前价格: ${}\n\n更新时间：{}\n\n24小时涨跌: {}{:.2}%",
        symbol,
        format_price(quote.value),
        at.format("%Y-%m-%d %H:%M"),
        sign(quote.change_percent),
        quote.change_percent
    )
}

fn sign(change: f64) -> &'static str {
    if change >= 0.0 {
        "+"
    } else {
        ""
    }
}

/// Fetches the 24h ticker for one symbol.
pub async fn fetch_quote(client: &reqwest::Client, symbol: &str) -> Result<PriceQuote> {
    let response = client
        .get(TICKER_ENDPOINT)
        .query(&[("symbol", symbol)])
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
        .with_context(|| format!("Ticker request for {} failed", symbol))?;
    if !response.status().is_success() {
        anyhow::bail!("Ticker request for {} returned {}", symbol, response.status());
    }
    let ticker: TickerResponse = response
        .json()
        .await
        .with_context(|| format!("Invalid ticker payload for {}", symbol))?;

    let value = ticker
        .last_price
        .as_deref()
        .and_then(|raw| raw.parse::<f64>().ok())
        .ok_or_else(|| anyhow::anyhow!("Ticker for {} has no usable price", symbol))?;
    let change_percent = ticker
        .price_change_percent
        .as_deref()
        .and_then(|raw| raw.parse::<f64>().ok())
        .unwrap_or(0.0);
    Ok(PriceQuote {
        value,
        change_percent,
    })
}
