use crate::exchange::{ExecutionRecord, Side};

/// Realised round-trip result rebuilt from executions. Funding credit is
/// settled separately by the exchange and is not part of this number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PnlSummary {
    pub pnl_usdt: Option<f64>,
    pub buys: usize,
    pub sells: usize,
    pub avg_buy: Option<f64>,
    pub avg_sell: Option<f64>,
}

/// Partitions executions into buys and sells and nets the notionals:
/// `pnl = sell_notional - buy_notional - fees`. An empty input yields an
/// empty summary, not an error.
pub fn reconstruct(execs: &[ExecutionRecord]) -> PnlSummary {
    let mut buy_notional = 0.0;
    let mut sell_notional = 0.0;
    let mut buy_qty = 0.0;
    let mut sell_qty = 0.0;
    let mut buys = 0usize;
    let mut sells = 0usize;
    let mut fee_total = 0.0;

    for exec in execs {
        if exec.qty <= 0.0 || exec.price <= 0.0 {
            continue;
        }
        let notional = exec.qty * exec.price;
        match exec.side {
            Side::Buy => {
                buys += 1;
                buy_notional += notional;
                buy_qty += exec.qty;
            }
            Side::Sell => {
                sells += 1;
                sell_notional += notional;
                sell_qty += exec.qty;
            }
        }
        fee_total += exec.fee_usdt.abs();
    }

    if buys == 0 && sells == 0 {
        return PnlSummary::default();
    }

    PnlSummary {
        pnl_usdt: Some(sell_notional - buy_notional - fee_total),
        buys,
        sells,
        avg_buy: (buy_qty > 0.0).then(|| buy_notional / buy_qty),
        avg_sell: (sell_qty > 0.0).then(|| sell_notional / sell_qty),
    }
}

#[cfg(test)]
mod tests {
    use crate::exchange::{ExecutionRecord, Side};

    use super::{reconstruct, PnlSummary};

    fn exec(side: Side, qty: f64, price: f64, time_ms: i64, fee: f64) -> ExecutionRecord {
        ExecutionRecord {
            symbol: "LPTUSDT".to_string(),
            order_id: format!("o-{time_ms}"),
            side,
            qty,
            price,
            exec_time_ms: time_ms,
            fee_usdt: fee,
        }
    }

    fn approx(left: f64, right: f64) {
        assert!((left - right).abs() < 1e-9, "left={left} right={right}");
    }

    #[test]
    fn short_round_trip_pnl() {
        let execs = [
            exec(Side::Sell, 5.0, 5.00, 1_000, 0.0),
            exec(Side::Buy, 5.0, 4.99, 2_000, 0.0),
        ];
        let summary = reconstruct(&execs);
        approx(summary.pnl_usdt.expect("two executions"), 0.05);
        assert_eq!(summary.sells, 1);
        assert_eq!(summary.buys, 1);
        approx(summary.avg_sell.expect("one sell"), 5.00);
        approx(summary.avg_buy.expect("one buy"), 4.99);
    }

    #[test]
    fn fees_reduce_pnl() {
        let execs = [
            exec(Side::Sell, 10.0, 5.0, 1_000, 0.02),
            exec(Side::Buy, 10.0, 4.99, 2_000, 0.02),
        ];
        let summary = reconstruct(&execs);
        approx(summary.pnl_usdt.expect("two executions"), 0.1 - 0.04);
    }

    #[test]
    fn empty_input_is_empty_summary() {
        assert_eq!(reconstruct(&[]), PnlSummary::default());
    }

    #[test]
    fn pnl_is_additive_over_disjoint_windows() {
        let execs = [
            exec(Side::Sell, 5.0, 5.00, 1_000, 0.01),
            exec(Side::Sell, 5.0, 5.01, 1_500, 0.01),
            exec(Side::Buy, 5.0, 4.99, 2_000, 0.01),
            exec(Side::Buy, 5.0, 4.98, 2_500, 0.01),
        ];
        let whole = reconstruct(&execs).pnl_usdt.expect("full window");

        let (early, late): (Vec<_>, Vec<_>) =
            execs.iter().cloned().partition(|e| e.exec_time_ms < 2_000);
        let split = reconstruct(&early).pnl_usdt.expect("early window")
            + reconstruct(&late).pnl_usdt.expect("late window");
        assert!((whole - split).abs() < 1e-9);
    }

    #[test]
    fn skips_degenerate_prints() {
        let execs = [
            exec(Side::Sell, 0.0, 5.0, 1_000, 0.0),
            exec(Side::Sell, 5.0, 0.0, 1_100, 0.0),
        ];
        assert_eq!(reconstruct(&execs), PnlSummary::default());
    }

    #[test]
    fn negative_fee_rebates_still_count_as_cost() {
        let execs = [
            exec(Side::Sell, 1.0, 5.0, 1_000, -0.01),
            exec(Side::Buy, 1.0, 5.0, 2_000, 0.0),
        ];
        approx(reconstruct(&execs).pnl_usdt.expect("round trip"), -0.01);
    }
}
