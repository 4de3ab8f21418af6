use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::FunSettings;
use crate::exchange::{BybitRest, Instrument, RestError};
use crate::quant;

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error(transparent)]
    Rest(#[from] RestError),
    #[error("quantity {0} is not representable at the instrument step")]
    QtyNotRepresentable(f64),
    #[error("quantity {qty} below minimum {min}")]
    QtyBelowMin { qty: Decimal, min: Decimal },
    #[error("order notional {notional:.4} below minimum {min}")]
    NotionalBelowMin { notional: f64, min: Decimal },
    #[error("insufficient balance: available {available:.4} USDT, required {required:.4} USDT")]
    InsufficientBalance { available: f64, required: f64 },
}

/// Everything the orchestrator needs resolved before the critical window.
#[derive(Debug, Clone)]
pub struct PreflightReport {
    pub instrument: Instrument,
    pub qty: Decimal,
    pub qty_str: String,
    /// Short size already on the book before the window; the reconciliation
    /// baseline when no fill confirmation arrives.
    pub short_before: f64,
}

/// Margin the wallet must cover: notional plus the configured buffer plus
/// the fee safety margin.
pub fn required_usdt(notional: f64, buffer_usdt: f64, fee_safety_bps: f64) -> f64 {
    notional + buffer_usdt.max(0.0) + notional * fee_safety_bps.max(0.0) / 10_000.0
}

/// Floors the requested quantity to the step and checks the minimum.
pub fn normalize_qty(qty_desired: f64, instrument: &Instrument) -> Result<Decimal, PreflightError> {
    let qty = quant::floor_f64_to_step(qty_desired, instrument.step)
        .ok_or(PreflightError::QtyNotRepresentable(qty_desired))?;
    if qty <= Decimal::ZERO || qty < instrument.min_qty {
        return Err(PreflightError::QtyBelowMin {
            qty,
            min: instrument.min_qty,
        });
    }
    Ok(qty)
}

pub fn check_min_notional(
    qty: Decimal,
    price_hint: f64,
    instrument: &Instrument,
) -> Result<(), PreflightError> {
    let Some(min) = instrument.min_notional else {
        return Ok(());
    };
    let notional = qty.to_f64().unwrap_or(0.0) * price_hint;
    let min_f64 = min.to_f64().unwrap_or(0.0);
    if notional < min_f64 {
        return Err(PreflightError::NotionalBelowMin { notional, min });
    }
    Ok(())
}

/// Resolves the instrument, validates quantity, notional and balance, does
/// best-effort margin prep and records the pre-window short baseline.
pub async fn run(
    rest: &BybitRest,
    settings: &FunSettings,
    symbol: &str,
    qty_desired: f64,
    price_hint: f64,
) -> Result<PreflightReport, PreflightError> {
    let instrument = rest.instrument(symbol).await?;
    let qty = normalize_qty(qty_desired, &instrument)?;
    check_min_notional(qty, price_hint, &instrument)?;

    let notional = qty.to_f64().unwrap_or(0.0) * price_hint;
    let required = required_usdt(
        notional,
        settings.balance_buffer_usdt,
        settings.balance_fee_safety_bps,
    );
    match rest.available_usdt().await {
        Ok(Some(available)) => {
            if available + 1e-6 < required {
                return Err(PreflightError::InsufficientBalance {
                    available,
                    required,
                });
            }
        }
        Ok(None) => {
            warn!("could not determine available USDT; continuing");
        }
        Err(error) => {
            warn!(error = %error, "balance check failed; continuing");
        }
    }

    // Isolated margin at 1x caps the exposure; failure here is not fatal.
    if let Err(error) = rest.prepare_isolated_1x(symbol).await {
        warn!(error = %error, "isolated/leverage prep failed; continuing");
    }

    let short_before = match rest.short_position_qty(symbol).await {
        Ok(qty) => qty,
        Err(error) => {
            warn!(error = %error, "pre-window position fetch failed; assuming flat");
            0.0
        }
    };

    let qty_str = quant::format_by_step(qty, instrument.step);
    info!(
        symbol,
        qty = %qty_str,
        notional,
        short_before,
        "preflight complete"
    );

    Ok(PreflightReport {
        instrument,
        qty,
        qty_str,
        short_before,
    })
}
