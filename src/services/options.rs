//! Options surface: chain building, greeks, synthetic futures, and
//! option-order helpers layered on the services facade.
//!
//! Contract discovery comes from the symbol master; pricing comes from the
//! quote capability. Greeks are closed-form Black-Scholes.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{LegResult, Services};
use crate::db;
use crate::error::{CoreError, CoreResult};
use crate::types::{OrderIntent, OrderSide, PriceType, ProductType, Quote};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionKind {
    #[serde(rename = "CE")]
    Call,
    #[serde(rename = "PE")]
    Put,
}

impl OptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionKind::Call => "CE",
            OptionKind::Put => "PE",
        }
    }
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed-form option valuation and sensitivities.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Greeks {
    pub price: f64,
    pub delta: f64,
    pub gamma: f64,
    /// Per calendar day.
    pub theta: f64,
    /// Per 1% volatility move.
    pub vega: f64,
    /// Per 1% rate move.
    pub rho: f64,
}

/// One strike of the chain, call and put side by side.
#[derive(Debug, Clone, Serialize)]
pub struct OptionChainRow {
    pub strike: f64,
    pub call_symbol: Option<String>,
    pub put_symbol: Option<String>,
    pub call: Option<Quote>,
    pub put: Option<Quote>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyntheticFuture {
    pub underlying: String,
    pub expiry: NaiveDate,
    pub strike: f64,
    /// K + C - P at the chosen strike (put-call parity).
    pub price: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GreeksRequest {
    pub exchange: String,
    #[serde(alias = "symbol")]
    pub underlying: String,
    pub expiry: NaiveDate,
    pub strike: f64,
    #[serde(alias = "optiontype")]
    pub kind: OptionKind,
    /// Annualized implied volatility; defaults to 25%.
    #[serde(default)]
    pub volatility: Option<f64>,
    /// Annualized risk-free rate; defaults to 7%.
    #[serde(default)]
    pub rate: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptionOrderRequest {
    pub exchange: String,
    #[serde(alias = "symbol")]
    pub underlying: String,
    pub expiry: NaiveDate,
    pub strike: f64,
    #[serde(alias = "optiontype")]
    pub kind: OptionKind,
    #[serde(alias = "action")]
    pub side: OrderSide,
    pub quantity: i64,
    #[serde(default)]
    pub product: Option<String>,
}

const DEFAULT_VOLATILITY: f64 = 0.25;
const DEFAULT_RATE: f64 = 0.07;

/// Standard normal CDF (Abramowitz & Stegun 7.1.26 erf approximation).
fn norm_cdf(x: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.3275911 * (x.abs() / std::f64::consts::SQRT_2));
    let poly = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    let erf = 1.0 - poly * (-x * x / 2.0).exp();
    if x >= 0.0 {
        0.5 * (1.0 + erf)
    } else {
        0.5 * (1.0 - erf)
    }
}

fn norm_pdf(x: f64) -> f64 {
    (-x * x / 2.0).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

/// Black-Scholes price and sensitivities for a European option.
pub fn black_scholes(
    kind: OptionKind,
    spot: f64,
    strike: f64,
    t_years: f64,
    volatility: f64,
    rate: f64,
) -> CoreResult<Greeks> {
    if spot <= 0.0 || strike <= 0.0 || t_years <= 0.0 || volatility <= 0.0 {
        return Err(CoreError::PayloadInvalid(
            "spot, strike, expiry and volatility must be positive".into(),
        ));
    }
    let sqrt_t = t_years.sqrt();
    let d1 = ((spot / strike).ln() + (rate + volatility * volatility / 2.0) * t_years)
        / (volatility * sqrt_t);
    let d2 = d1 - volatility * sqrt_t;
    let discount = (-rate * t_years).exp();

    let (price, delta, rho) = match kind {
        OptionKind::Call => (
            spot * norm_cdf(d1) - strike * discount * norm_cdf(d2),
            norm_cdf(d1),
            strike * t_years * discount * norm_cdf(d2) / 100.0,
        ),
        OptionKind::Put => (
            strike * discount * norm_cdf(-d2) - spot * norm_cdf(-d1),
            norm_cdf(d1) - 1.0,
            -strike * t_years * discount * norm_cdf(-d2) / 100.0,
        ),
    };
    let gamma = norm_pdf(d1) / (spot * volatility * sqrt_t);
    let vega = spot * norm_pdf(d1) * sqrt_t / 100.0;
    let theta_annual = match kind {
        OptionKind::Call => {
            -spot * norm_pdf(d1) * volatility / (2.0 * sqrt_t)
                - rate * strike * discount * norm_cdf(d2)
        }
        OptionKind::Put => {
            -spot * norm_pdf(d1) * volatility / (2.0 * sqrt_t)
                + rate * strike * discount * norm_cdf(-d2)
        }
    };
    Ok(Greeks {
        price,
        delta,
        gamma,
        theta: theta_annual / 365.0,
        vega,
        rho,
    })
}

/// Exchange-style trading symbol for one contract, e.g.
/// `NIFTY25JAN2421000CE`.
pub fn option_symbol(underlying: &str, expiry: NaiveDate, strike: f64, kind: OptionKind) -> String {
    let date = expiry.format("%d%b%y").to_string().to_uppercase();
    let strike_text = if strike.fract() == 0.0 {
        format!("{}", strike as i64)
    } else {
        format!("{strike}")
    };
    format!(
        "{}{}{}{}",
        underlying.to_uppercase(),
        date,
        strike_text,
        kind.as_str()
    )
}

impl Services {
    pub async fn option_expiries(
        &self,
        exchange: &str,
        underlying: &str,
    ) -> CoreResult<Vec<NaiveDate>> {
        db::list_expiries(self.pool(), exchange, &underlying.to_uppercase(), "CE").await
    }

    /// Chain for an underlying: one row per strike with quoted legs.
    pub async fn option_chain(
        &self,
        exchange: &str,
        underlying: &str,
        expiry: Option<NaiveDate>,
    ) -> CoreResult<Vec<OptionChainRow>> {
        let contracts =
            db::option_instruments(self.pool(), exchange, &underlying.to_uppercase(), expiry)
                .await?;
        if contracts.is_empty() {
            return Ok(Vec::new());
        }

        let pairs: Vec<(String, String)> = contracts
            .iter()
            .map(|c| (c.exchange.clone(), c.symbol.clone()))
            .collect();
        let quotes = self.quotes(&pairs).await?;
        let quote_for = |symbol: &str| -> Option<Quote> {
            quotes
                .iter()
                .find(|q| q.symbol.eq_ignore_ascii_case(symbol))
                .cloned()
        };

        let mut rows: Vec<OptionChainRow> = Vec::new();
        for contract in &contracts {
            let Some(strike) = contract.strike else {
                continue;
            };
            let row = match rows.iter_mut().find(|r| r.strike == strike) {
                Some(row) => row,
                None => {
                    rows.push(OptionChainRow {
                        strike,
                        call_symbol: None,
                        put_symbol: None,
                        call: None,
                        put: None,
                    });
                    rows.last_mut().expect("just pushed")
                }
            };
            match contract.instrument_type.as_str() {
                "CE" => {
                    row.call_symbol = Some(contract.symbol.clone());
                    row.call = quote_for(&contract.symbol);
                }
                "PE" => {
                    row.put_symbol = Some(contract.symbol.clone());
                    row.put = quote_for(&contract.symbol);
                }
                _ => {}
            }
        }
        rows.sort_by(|a, b| a.strike.total_cmp(&b.strike));
        Ok(rows)
    }

    /// Synthetic future via put-call parity at the strike nearest spot.
    pub async fn synthetic_future(
        &self,
        exchange: &str,
        underlying: &str,
        expiry: NaiveDate,
    ) -> CoreResult<SyntheticFuture> {
        let spot = self.quote(exchange, underlying).await?.last_price;
        let chain = self.option_chain(exchange, underlying, Some(expiry)).await?;
        let row = chain
            .iter()
            .filter(|r| r.call.is_some() && r.put.is_some())
            .min_by(|a, b| {
                (a.strike - spot)
                    .abs()
                    .total_cmp(&(b.strike - spot).abs())
            })
            .ok_or_else(|| {
                CoreError::PayloadInvalid(format!(
                    "no quoted call/put pair for {underlying} {expiry}"
                ))
            })?;
        let call = row.call.as_ref().expect("filtered").last_price;
        let put = row.put.as_ref().expect("filtered").last_price;
        Ok(SyntheticFuture {
            underlying: underlying.to_uppercase(),
            expiry,
            strike: row.strike,
            price: row.strike + call - put,
        })
    }

    /// Greeks for one contract, spot taken from the live quote.
    pub async fn option_greeks(&self, req: &GreeksRequest) -> CoreResult<Greeks> {
        let spot = self.quote(&req.exchange, &req.underlying).await?.last_price;
        let today = Utc::now().date_naive();
        let days = (req.expiry - today).num_days();
        if days <= 0 {
            return Err(CoreError::PayloadInvalid("contract has expired".into()));
        }
        black_scholes(
            req.kind,
            spot,
            req.strike,
            days as f64 / 365.0,
            req.volatility.unwrap_or(DEFAULT_VOLATILITY),
            req.rate.unwrap_or(DEFAULT_RATE),
        )
    }

    fn option_intent(&self, req: &OptionOrderRequest) -> CoreResult<OrderIntent> {
        let product = match &req.product {
            Some(p) => ProductType::parse(p)?,
            None => ProductType::Nrml,
        };
        if req.quantity <= 0 {
            return Err(CoreError::PayloadInvalid("quantity must be positive".into()));
        }
        let symbol = option_symbol(&req.underlying, req.expiry, req.strike, req.kind);
        // When the master is loaded the contract must exist in it.
        if !self.symbols().is_empty() && self.symbols().lookup(&req.exchange, &symbol).is_none() {
            return Err(CoreError::PayloadInvalid(format!(
                "unknown option contract {symbol}"
            )));
        }
        Ok(OrderIntent {
            symbol,
            exchange: req.exchange.clone(),
            side: req.side,
            quantity: req.quantity,
            product,
            price_type: PriceType::Market,
            price: 0.0,
            trigger_price: 0.0,
            strategy: None,
        })
    }

    pub async fn options_order(&self, req: &OptionOrderRequest) -> CoreResult<crate::types::Order> {
        let intent = self.option_intent(req)?;
        self.place_order(&intent).await
    }

    /// Multi-leg option order (spreads, straddles); basket semantics.
    pub async fn options_multi_order(
        &self,
        legs: &[OptionOrderRequest],
    ) -> CoreResult<Vec<LegResult>> {
        if legs.is_empty() {
            return Err(CoreError::PayloadInvalid("no legs".into()));
        }
        let intents = legs
            .iter()
            .map(|leg| self.option_intent(leg))
            .collect::<CoreResult<Vec<_>>>()?;
        self.basket_order(&intents).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_norm_cdf_reference_points() {
        assert!((norm_cdf(0.0) - 0.5).abs() < 1e-6);
        assert!((norm_cdf(1.96) - 0.975).abs() < 1e-3);
        assert!((norm_cdf(-1.96) - 0.025).abs() < 1e-3);
    }

    #[test]
    fn test_black_scholes_atm_call() {
        // S=100, K=100, t=1y, vol=20%, r=5% -> C ~ 10.45 (textbook value).
        let greeks =
            black_scholes(OptionKind::Call, 100.0, 100.0, 1.0, 0.2, 0.05).unwrap();
        assert!((greeks.price - 10.45).abs() < 0.05, "price {}", greeks.price);
        assert!(greeks.delta > 0.6 && greeks.delta < 0.7);
        assert!(greeks.gamma > 0.0);
        assert!(greeks.theta < 0.0);
    }

    #[test]
    fn test_put_call_parity() {
        let call = black_scholes(OptionKind::Call, 100.0, 95.0, 0.5, 0.3, 0.05).unwrap();
        let put = black_scholes(OptionKind::Put, 100.0, 95.0, 0.5, 0.3, 0.05).unwrap();
        // C - P = S - K e^{-rt}
        let lhs = call.price - put.price;
        let rhs = 100.0 - 95.0 * (-0.05f64 * 0.5).exp();
        assert!((lhs - rhs).abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_inputs_rejected() {
        assert!(black_scholes(OptionKind::Call, 0.0, 100.0, 1.0, 0.2, 0.05).is_err());
        assert!(black_scholes(OptionKind::Call, 100.0, 100.0, 0.0, 0.2, 0.05).is_err());
    }

    #[test]
    fn test_option_symbol_format() {
        let expiry = NaiveDate::from_ymd_opt(2024, 1, 25).unwrap();
        assert_eq!(
            option_symbol("nifty", expiry, 21000.0, OptionKind::Call),
            "NIFTY25JAN2421000CE"
        );
        assert_eq!(
            option_symbol("BANKNIFTY", expiry, 45500.5, OptionKind::Put),
            "BANKNIFTY25JAN2445500.5PE"
        );
    }
}
