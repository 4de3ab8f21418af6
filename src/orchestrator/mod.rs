use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::account::{OrderFinal, WaitError};
use crate::config::FunSettings;
use crate::exchange::{ExecutionRecord, Instrument, OrderDraft, Side};
use crate::marketdata::MarketState;
use crate::pnl::{self, PnlSummary};
use crate::quant;
use crate::tradews::TradeError;

const OPEN_ACK_TIMEOUT_MS: u64 = 500;
const FILL_WAIT_TIMEOUT_MS: u64 = 1_500;
const CLOSE_ACK_TIMEOUT_MS: u64 = 500;
const CLOSE_FILL_WAIT_MS: u64 = 800;
const RECONCILE_POLL_MS: i64 = 50;
const EXEC_WINDOW_LOOKBACK_MS: i64 = 5_000;
const EXEC_WINDOW_LOOKAHEAD_MS: i64 = 10_000;

/// Deadline source. The live implementation is the fixed-offset server
/// clock; tests drive time by hand.
#[allow(async_fn_in_trait)]
pub trait PayoutClock {
    fn now_server_ms(&self) -> i64;
    async fn sleep_until_server_ms(&self, deadline_server_ms: i64);
}

pub trait MarketFeed {
    fn snapshot(&self) -> (MarketState, i64);
}

#[allow(async_fn_in_trait)]
pub trait AccountStream {
    async fn wait_final(&self, order_id: &str, timeout_ms: u64) -> Result<OrderFinal, WaitError>;
    fn position_size(&self, symbol: &str, position_idx: u8, side: Side) -> Option<f64>;
    fn executions_in_window(&self, symbol: &str, start_ms: i64, end_ms: i64)
        -> Vec<ExecutionRecord>;
    fn staleness_ms(&self) -> i64;
}

#[allow(async_fn_in_trait)]
pub trait TradeChannel {
    async fn create_order(
        &self,
        symbol: &str,
        draft: &OrderDraft,
        server_ts_ms: i64,
        timeout_ms: u64,
    ) -> Result<String, TradeError>;
}

/// REST last resort for reconciliation and reporting when the private
/// stream has nothing to say.
#[allow(async_fn_in_trait)]
pub trait PositionFallback {
    async fn short_position_qty(&self, symbol: &str) -> Option<f64>;
    async fn executions(&self, symbol: &str, start_ms: i64, end_ms: i64) -> Vec<ExecutionRecord>;
}

/// Server-time schedule and admission plan for one payout, fixed before the
/// critical window.
#[derive(Debug, Clone, Copy)]
pub struct TradePlan {
    pub payout_server_ms: i64,
    pub fix_server_ms: i64,
    pub open_server_ms: i64,
    pub close_server_ms: i64,
    pub entry_bps_plan: f64,
}

impl TradePlan {
    pub fn build(payout_server_ms: i64, settings: &FunSettings, funding_pct: f64) -> Self {
        Self {
            payout_server_ms,
            fix_server_ms: payout_server_ms - settings.ws_fix_lead_ms(),
            open_server_ms: payout_server_ms - settings.open_early_ms(),
            close_server_ms: payout_server_ms
                + (settings.fast_close_delay_sec.max(0.0) * 1_000.0) as i64,
            entry_bps_plan: entry_bps_plan(settings, funding_pct),
        }
    }
}

/// Maximum tolerated drop (bps) between fix and open, scaled by the funding
/// magnitude and clamped to the configured band.
pub fn entry_bps_plan(settings: &FunSettings, funding_pct: f64) -> f64 {
    let raw = settings.entry_base_bps
        + settings.entry_funding_mult * (funding_pct.abs() * 10_000.0);
    raw.clamp(settings.entry_min_bps, settings.entry_max_bps)
}

/// Fractional drop of the open-time bid under the fixed reference, in bps.
pub fn down_bps(ref_px_fix: f64, best_bid_open: f64) -> f64 {
    (ref_px_fix - best_bid_open) / ref_px_fix * 10_000.0
}

#[derive(Debug, Clone, PartialEq)]
pub enum PayoutOutcome {
    /// The snapshot was stale or incomplete; nothing was sent.
    SkipStale,
    /// The bid fell further than the admission plan tolerates.
    SkipDown { down_bps: f64 },
    /// No position was opened, conclusively.
    NoFill,
    Closed(PnlSummary),
    /// Close attempts ran out with size still on the book. Reported, not
    /// retried; the operator takes over.
    ResidualOpen { remaining: f64, summary: PnlSummary },
}

/// Drives one payout end to end: fix, admission, open, reconcile, close,
/// report. Every leaf error collapses into a `PayoutOutcome`; nothing
/// unwinds past this type.
pub struct Orchestrator<'a, C, M, A, T, F> {
    pub clock: &'a C,
    pub market: &'a M,
    pub account: &'a A,
    pub trade: &'a T,
    pub fallback: &'a F,
    pub settings: &'a FunSettings,
    pub instrument: &'a Instrument,
    pub qty_str: String,
    pub funding_pct: f64,
    pub short_before: f64,
    pub position_idx: u8,
}

impl<C, M, A, T, F> Orchestrator<'_, C, M, A, T, F>
where
    C: PayoutClock,
    M: MarketFeed,
    A: AccountStream,
    T: TradeChannel,
    F: PositionFallback,
{
    pub async fn run(&self, payout_server_ms: i64) -> PayoutOutcome {
        let plan = TradePlan::build(payout_server_ms, self.settings, self.funding_pct);
        info!(
            payout_server_ms = plan.payout_server_ms,
            fix_server_ms = plan.fix_server_ms,
            open_server_ms = plan.open_server_ms,
            close_server_ms = plan.close_server_ms,
            entry_bps_plan = plan.entry_bps_plan,
            "payout plan"
        );

        // Fix step: reference price for the admission check, never for pricing.
        self.clock.sleep_until_server_ms(plan.fix_server_ms).await;
        let max_stale = self.settings.open_max_staleness_ms();
        let (fix, freshness) = self.market.snapshot();
        if freshness > max_stale || !fix.ready() {
            warn!(freshness_ms = freshness, "stale snapshot at fix; skipping");
            return PayoutOutcome::SkipStale;
        }
        let ref_px_fix = match (fix.last_price(), fix.best_bid) {
            (Some(last), Some(bid)) if last > 0.0 && bid > 0.0 => last.min(bid),
            _ => {
                warn!("no usable reference price at fix; skipping");
                return PayoutOutcome::SkipStale;
            }
        };

        // Open step: the order is dispatched before payout so it rests in
        // the book at the instant the funding is credited.
        self.clock.sleep_until_server_ms(plan.open_server_ms).await;
        let (open_snap, freshness) = self.market.snapshot();
        let best_bid_open = match open_snap.best_bid {
            Some(bid) if freshness <= max_stale && open_snap.ready() => bid,
            _ => {
                warn!(freshness_ms = freshness, "stale snapshot at open; refusing to open");
                return PayoutOutcome::SkipStale;
            }
        };

        let down = down_bps(ref_px_fix, best_bid_open);
        let mut order_id: Option<String> = None;
        let mut attempted = false;

        if down > plan.entry_bps_plan {
            warn!(
                down_bps = down,
                entry_bps_plan = plan.entry_bps_plan,
                "SKIP OPEN"
            );
        } else if let Some(price) = self.open_price(best_bid_open) {
            attempted = true;
            let draft = OrderDraft::sell_open(self.qty_str.clone(), price, self.position_idx);
            info!(price = %draft.price, qty = %draft.qty, down_bps = down, "submitting open");
            match self
                .trade
                .create_order(
                    &self.instrument.symbol,
                    &draft,
                    self.clock.now_server_ms(),
                    OPEN_ACK_TIMEOUT_MS,
                )
                .await
            {
                Ok(id) => order_id = Some(id),
                Err(trade_error) => {
                    // The request may have landed server-side anyway; the
                    // reconciliation step owns the truth from here.
                    warn!(error = %trade_error, "open not acknowledged; reconciling");
                }
            }
        } else {
            error!(best_bid_open, "open price quantisation failed");
            return PayoutOutcome::SkipStale;
        }

        let opened = self.reconcile(order_id.as_deref(), attempted, &plan).await;
        if opened <= 0.0 {
            if attempted {
                info!("no fill");
                return PayoutOutcome::NoFill;
            }
            return PayoutOutcome::SkipDown { down_bps: down };
        }

        info!(opened, "short open; scheduling close");
        let remaining = self.close(opened, &plan).await;
        self.report(remaining, &plan).await
    }

    fn open_price(&self, best_bid_open: f64) -> Option<String> {
        let ticks = Decimal::from(self.settings.entry_ticks());
        let bid = quant::from_f64(best_bid_open)?;
        let px = quant::floor_to_step(bid - ticks * self.instrument.tick, self.instrument.tick);
        if px <= Decimal::ZERO {
            return None;
        }
        Some(quant::format_by_step(px, self.instrument.tick))
    }

    fn close_price(&self, anchor: f64) -> Option<String> {
        let ticks = Decimal::from(self.settings.entry_ticks());
        let px = quant::ceil_f64_to_step(anchor, self.instrument.tick)?
            + ticks * self.instrument.tick;
        if px <= Decimal::ZERO {
            return None;
        }
        Some(quant::format_by_step(px, self.instrument.tick))
    }

    /// Establishes how much actually opened, in order of trust: the final
    /// order state, the private position cache polled up to the close
    /// deadline, then a REST position snapshot.
    async fn reconcile(&self, order_id: Option<&str>, attempted: bool, plan: &TradePlan) -> f64 {
        if let Some(id) = order_id {
            match self.account.wait_final(id, FILL_WAIT_TIMEOUT_MS).await {
                Ok(terminal) => {
                    if terminal.filled_qty > 0.0 {
                        info!(
                            filled_qty = terminal.filled_qty,
                            avg_price = ?terminal.avg_price,
                            "open fill confirmed"
                        );
                        return terminal.filled_qty;
                    }
                    info!(status = ?terminal.status, "open ended with zero fill");
                    return 0.0;
                }
                Err(wait_error) => {
                    warn!(error = %wait_error, "no fill confirmation; checking position");
                }
            }
        }

        if !attempted {
            if let Some(opened) = self.opened_from_cache() {
                return opened;
            }
            return self.opened_from_rest().await;
        }

        loop {
            if let Some(opened) = self.opened_from_cache() {
                if opened > 0.0 {
                    return opened;
                }
            }
            let now = self.clock.now_server_ms();
            if now >= plan.close_server_ms {
                break;
            }
            self.clock
                .sleep_until_server_ms((now + RECONCILE_POLL_MS).min(plan.close_server_ms))
                .await;
        }
        self.opened_from_rest().await
    }

    fn opened_from_cache(&self) -> Option<f64> {
        self.account
            .position_size(&self.instrument.symbol, self.position_idx, Side::Sell)
            .map(|size| (size - self.short_before).max(0.0))
    }

    async fn opened_from_rest(&self) -> f64 {
        match self
            .fallback
            .short_position_qty(&self.instrument.symbol)
            .await
        {
            Some(size) => (size - self.short_before).max(0.0),
            None => 0.0,
        }
    }

    /// Reduce-only buy loop from the close deadline. Stops when the position
    /// cache reads flat or the attempt budget runs out.
    async fn close(&self, opened: f64, plan: &TradePlan) -> f64 {
        self.clock
            .sleep_until_server_ms(plan.close_server_ms)
            .await;

        let mut remaining = opened;
        let max_attempts = self.settings.fast_close_max_attempts();

        for attempt in 1..=max_attempts {
            if self.position_flat() {
                remaining = 0.0;
                break;
            }

            let (snap, _) = self.market.snapshot();
            let Some(anchor) = snap.best_ask.or(snap.best_bid) else {
                warn!(attempt, "no book for close pricing; retrying");
                continue;
            };
            let Some(price) = self.close_price(anchor) else {
                continue;
            };
            let Some(qty) = quant::ceil_f64_to_step(remaining, self.instrument.step)
                .filter(|q| *q > Decimal::ZERO)
            else {
                break;
            };
            let qty = quant::format_by_step(qty, self.instrument.step);

            let draft = OrderDraft::buy_close(qty, price, self.position_idx);
            match self
                .trade
                .create_order(
                    &self.instrument.symbol,
                    &draft,
                    self.clock.now_server_ms(),
                    CLOSE_ACK_TIMEOUT_MS,
                )
                .await
            {
                Ok(id) => match self.account.wait_final(&id, CLOSE_FILL_WAIT_MS).await {
                    Ok(terminal) => {
                        remaining = (remaining - terminal.filled_qty).max(0.0);
                    }
                    Err(wait_error) => {
                        warn!(attempt, error = %wait_error, "close fill unconfirmed");
                    }
                },
                Err(trade_error) => {
                    warn!(attempt, error = %trade_error, "close submit failed");
                }
            }

            // The stream's view wins when it has one, but never upwards:
            // a stale position event must not re-inflate the remainder.
            if let Some(cached) = self.opened_from_cache() {
                remaining = remaining.min(cached);
            }
            if remaining <= 0.0 || self.position_flat() {
                remaining = 0.0;
                break;
            }
        }

        remaining
    }

    fn position_flat(&self) -> bool {
        let buy_flat = matches!(
            self.account
                .position_size(&self.instrument.symbol, self.position_idx, Side::Buy),
            Some(q) if q <= 0.0
        );
        let sell_flat = matches!(
            self.account
                .position_size(&self.instrument.symbol, self.position_idx, Side::Sell),
            Some(q) if q <= self.short_before
        );
        buy_flat || sell_flat
    }

    async fn report(&self, remaining: f64, plan: &TradePlan) -> PayoutOutcome {
        let start_ms = plan.open_server_ms - EXEC_WINDOW_LOOKBACK_MS;
        let end_ms = plan.close_server_ms + EXEC_WINDOW_LOOKAHEAD_MS;

        let mut execs =
            self.account
                .executions_in_window(&self.instrument.symbol, start_ms, end_ms);
        if execs.is_empty() {
            execs = self
                .fallback
                .executions(&self.instrument.symbol, start_ms, end_ms)
                .await;
        }

        let summary = pnl::reconstruct(&execs);
        info!(
            symbol = %self.instrument.symbol,
            avg_buy = ?summary.avg_buy,
            avg_sell = ?summary.avg_sell,
            buys = summary.buys,
            sells = summary.sells,
            pnl_usdt = ?summary.pnl_usdt,
            remaining,
            "payout summary"
        );

        if remaining > 0.0 {
            error!(
                remaining,
                "position not fully closed after attempt budget; operator intervention required"
            );
            PayoutOutcome::ResidualOpen { remaining, summary }
        } else {
            PayoutOutcome::Closed(summary)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    use rust_decimal_macros::dec;

    use crate::account::{OrderFinal, OrderStatus, WaitError};
    use crate::config::FunSettings;
    use crate::exchange::{ExecutionRecord, Instrument, OrderDraft, Side};
    use crate::marketdata::MarketState;
    use crate::tradews::TradeError;

    use super::{
        down_bps, entry_bps_plan, AccountStream, MarketFeed, Orchestrator, PayoutClock,
        PayoutOutcome, PositionFallback, TradeChannel, TradePlan,
    };

    const PAYOUT_MS: i64 = 1_700_000_000_000;

    struct FakeClock {
        now: AtomicI64,
    }

    impl FakeClock {
        fn starting_at(now: i64) -> Self {
            Self {
                now: AtomicI64::new(now),
            }
        }
    }

    impl PayoutClock for FakeClock {
        fn now_server_ms(&self) -> i64 {
            self.now.load(Ordering::Relaxed)
        }

        async fn sleep_until_server_ms(&self, deadline_server_ms: i64) {
            let now = self.now.load(Ordering::Relaxed);
            if deadline_server_ms > now {
                self.now.store(deadline_server_ms, Ordering::Relaxed);
            }
        }
    }

    struct FakeMarket {
        snaps: Mutex<VecDeque<(MarketState, i64)>>,
        last: Mutex<(MarketState, i64)>,
    }

    impl FakeMarket {
        fn scripted(snaps: Vec<(MarketState, i64)>) -> Self {
            let last = snaps
                .last()
                .cloned()
                .unwrap_or((MarketState::default(), i64::MAX));
            Self {
                snaps: Mutex::new(snaps.into()),
                last: Mutex::new(last),
            }
        }
    }

    impl MarketFeed for FakeMarket {
        fn snapshot(&self) -> (MarketState, i64) {
            let mut queue = self.snaps.lock().expect("test lock");
            match queue.pop_front() {
                Some(snap) => {
                    *self.last.lock().expect("test lock") = snap.clone();
                    snap
                }
                None => self.last.lock().expect("test lock").clone(),
            }
        }
    }

    fn book(bid: f64, ask: f64, last: f64) -> MarketState {
        MarketState {
            best_bid: Some(bid),
            best_ask: Some(ask),
            last_trade: Some(last),
            last_ticker: None,
            received_ms: 1,
        }
    }

    #[derive(Default)]
    struct World {
        orders: Vec<(String, OrderDraft)>,
        open_ack: Option<Result<String, TradeError>>,
        open_final: Option<Result<OrderFinal, WaitError>>,
        open_fill_on_venue: f64,
        close_fills: VecDeque<Result<f64, WaitError>>,
        venue_short: f64,
        position_visible: bool,
        flat_seen: bool,
        rest_short: Option<f64>,
        execs: Vec<ExecutionRecord>,
        next_close_id: u64,
    }

    /// One fake standing in for the account stream, the trade channel and
    /// the REST fallback, so order flow and position state stay coherent.
    struct FakeVenue {
        world: Mutex<World>,
    }

    impl FakeVenue {
        fn new(world: World) -> Self {
            Self {
                world: Mutex::new(world),
            }
        }

        fn orders(&self) -> Vec<(String, OrderDraft)> {
            self.world.lock().expect("test lock").orders.clone()
        }
    }

    impl TradeChannel for FakeVenue {
        async fn create_order(
            &self,
            symbol: &str,
            draft: &OrderDraft,
            _server_ts_ms: i64,
            _timeout_ms: u64,
        ) -> Result<String, TradeError> {
            let mut world = self.world.lock().expect("test lock");
            world.orders.push((symbol.to_string(), draft.clone()));
            match draft.side {
                Side::Sell => {
                    world.venue_short += world.open_fill_on_venue;
                    world
                        .open_ack
                        .take()
                        .unwrap_or(Ok("open-1".to_string()))
                }
                Side::Buy => {
                    world.next_close_id += 1;
                    Ok(format!("close-{}", world.next_close_id))
                }
            }
        }
    }

    impl AccountStream for FakeVenue {
        async fn wait_final(
            &self,
            order_id: &str,
            _timeout_ms: u64,
        ) -> Result<OrderFinal, WaitError> {
            let mut world = self.world.lock().expect("test lock");
            if order_id.starts_with("open") {
                return world.open_final.take().unwrap_or(Err(WaitError::TimedOut));
            }
            match world.close_fills.pop_front() {
                Some(Ok(filled_qty)) => {
                    world.venue_short = (world.venue_short - filled_qty).max(0.0);
                    if world.venue_short <= 0.0 && filled_qty > 0.0 {
                        world.flat_seen = true;
                    }
                    Ok(OrderFinal {
                        order_id: order_id.to_string(),
                        status: if filled_qty > 0.0 {
                            OrderStatus::Filled
                        } else {
                            OrderStatus::Cancelled
                        },
                        filled_qty,
                        avg_price: None,
                    })
                }
                Some(Err(wait_error)) => Err(wait_error),
                None => Err(WaitError::TimedOut),
            }
        }

        fn position_size(&self, _symbol: &str, _position_idx: u8, side: Side) -> Option<f64> {
            let world = self.world.lock().expect("test lock");
            match side {
                Side::Sell => world.position_visible.then_some(world.venue_short),
                Side::Buy => world.flat_seen.then_some(0.0),
            }
        }

        fn executions_in_window(
            &self,
            _symbol: &str,
            start_ms: i64,
            end_ms: i64,
        ) -> Vec<ExecutionRecord> {
            self.world
                .lock()
                .expect("test lock")
                .execs
                .iter()
                .filter(|e| e.exec_time_ms >= start_ms && e.exec_time_ms <= end_ms)
                .cloned()
                .collect()
        }

        fn staleness_ms(&self) -> i64 {
            0
        }
    }

    impl PositionFallback for FakeVenue {
        async fn short_position_qty(&self, _symbol: &str) -> Option<f64> {
            self.world.lock().expect("test lock").rest_short
        }

        async fn executions(
            &self,
            _symbol: &str,
            _start_ms: i64,
            _end_ms: i64,
        ) -> Vec<ExecutionRecord> {
            Vec::new()
        }
    }

    fn instrument() -> Instrument {
        Instrument {
            symbol: "LPTUSDT".to_string(),
            tick: dec!(0.0001),
            step: dec!(0.01),
            min_qty: dec!(0.01),
            min_notional: None,
        }
    }

    fn exec(side: Side, qty: f64, price: f64, time_ms: i64) -> ExecutionRecord {
        ExecutionRecord {
            symbol: "LPTUSDT".to_string(),
            order_id: format!("e-{time_ms}"),
            side,
            qty,
            price,
            exec_time_ms: time_ms,
            fee_usdt: 0.0,
        }
    }

    fn run_orchestrator<'a>(
        clock: &'a FakeClock,
        market: &'a FakeMarket,
        venue: &'a FakeVenue,
        settings: &'a FunSettings,
        instrument: &'a Instrument,
    ) -> Orchestrator<'a, FakeClock, FakeMarket, FakeVenue, FakeVenue, FakeVenue> {
        Orchestrator {
            clock,
            market,
            account: venue,
            trade: venue,
            fallback: venue,
            settings,
            instrument,
            qty_str: "10.00".to_string(),
            funding_pct: -0.005,
            short_before: 0.0,
            position_idx: 0,
        }
    }

    #[test]
    fn admission_plan_clamps() {
        let settings = FunSettings::default();
        // -0.5% funding: 40 + 0.9 * 50 = 85.
        assert!((entry_bps_plan(&settings, -0.005) - 85.0).abs() < 1e-9);

        // Huge funding pins at the max.
        assert_eq!(entry_bps_plan(&settings, -0.5), 2_500.0);

        // A small base clamps up to the min.
        let low = FunSettings {
            entry_base_bps: 10.0,
            entry_funding_mult: 0.0,
            ..FunSettings::default()
        };
        assert_eq!(entry_bps_plan(&low, -0.005), 30.0);
    }

    #[test]
    fn unchanged_bid_passes_admission() {
        let settings = FunSettings::default();
        let plan = entry_bps_plan(&settings, -0.005);
        let down = down_bps(5.0, 5.0);
        assert_eq!(down, 0.0);
        // Admission rejects only strictly beyond the plan.
        assert!(down <= plan);
    }

    #[test]
    fn plan_brackets_the_payout() {
        let settings = FunSettings::default();
        let plan = TradePlan::build(PAYOUT_MS, &settings, -0.005);
        assert!(plan.open_server_ms < plan.payout_server_ms);
        assert!(plan.close_server_ms > plan.payout_server_ms);
        assert_eq!(plan.fix_server_ms, PAYOUT_MS - 30);
        assert_eq!(plan.open_server_ms, PAYOUT_MS - 30);
        assert_eq!(plan.close_server_ms, PAYOUT_MS + 1_200);
    }

    #[tokio::test]
    async fn happy_path_opens_fills_and_closes() {
        let clock = FakeClock::starting_at(PAYOUT_MS - 2_000);
        let market = FakeMarket::scripted(vec![
            (book(5.0000, 5.0002, 5.0000), 10), // fix
            (book(4.9990, 4.9992, 4.9990), 10), // open: -2 bps
            (book(4.9990, 4.9992, 4.9990), 10), // close attempt
        ]);
        let venue = FakeVenue::new(World {
            open_final: Some(Ok(OrderFinal {
                order_id: "open-1".to_string(),
                status: OrderStatus::Filled,
                filled_qty: 10.0,
                avg_price: Some(4.9987),
            })),
            open_fill_on_venue: 10.0,
            close_fills: VecDeque::from([Ok(10.0)]),
            position_visible: true,
            execs: vec![
                exec(Side::Sell, 10.0, 4.9987, PAYOUT_MS),
                exec(Side::Buy, 10.0, 4.9995, PAYOUT_MS + 1_300),
            ],
            ..World::default()
        });
        let settings = FunSettings::default();
        let inst = instrument();

        let outcome = run_orchestrator(&clock, &market, &venue, &settings, &inst)
            .run(PAYOUT_MS)
            .await;

        let orders = venue.orders();
        assert_eq!(orders.len(), 2);

        let (_, open) = &orders[0];
        assert_eq!(open.side, Side::Sell);
        assert!(!open.reduce_only);
        assert_eq!(open.price, "4.9987"); // 3 ticks under the open bid
        assert_eq!(open.qty, "10.00");

        let (_, close) = &orders[1];
        assert_eq!(close.side, Side::Buy);
        assert!(close.reduce_only);
        assert_eq!(close.price, "4.9995"); // 3 ticks over the ask
        assert_eq!(close.qty, "10.00");

        match outcome {
            PayoutOutcome::Closed(summary) => {
                assert_eq!(summary.sells, 1);
                assert_eq!(summary.buys, 1);
                let pnl = summary.pnl_usdt.expect("round trip present");
                assert!((pnl - (4.9987 - 4.9995) * 10.0).abs() < 1e-6);
            }
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deep_drop_skips_open_without_orders() {
        let clock = FakeClock::starting_at(PAYOUT_MS - 2_000);
        let market = FakeMarket::scripted(vec![
            (book(5.0000, 5.0002, 5.0000), 10),
            (book(4.9500, 4.9502, 4.9500), 10), // -100 bps > 85
        ]);
        let venue = FakeVenue::new(World {
            position_visible: true,
            ..World::default()
        });
        let settings = FunSettings::default();
        let inst = instrument();

        let outcome = run_orchestrator(&clock, &market, &venue, &settings, &inst)
            .run(PAYOUT_MS)
            .await;

        assert!(venue.orders().is_empty());
        match outcome {
            PayoutOutcome::SkipDown { down_bps } => {
                assert!((down_bps - 100.0).abs() < 1.0);
            }
            other => panic!("expected SkipDown, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_snapshot_at_fix_skips() {
        let clock = FakeClock::starting_at(PAYOUT_MS - 2_000);
        let market = FakeMarket::scripted(vec![(book(5.0, 5.0002, 5.0), 350)]);
        let venue = FakeVenue::new(World::default());
        let settings = FunSettings::default();
        let inst = instrument();

        let outcome = run_orchestrator(&clock, &market, &venue, &settings, &inst)
            .run(PAYOUT_MS)
            .await;

        assert_eq!(outcome, PayoutOutcome::SkipStale);
        assert!(venue.orders().is_empty());
    }

    #[tokio::test]
    async fn ambiguous_ack_reconciles_from_position_and_closes() {
        let clock = FakeClock::starting_at(PAYOUT_MS - 2_000);
        let market = FakeMarket::scripted(vec![
            (book(5.0000, 5.0002, 5.0000), 10),
            (book(4.9990, 4.9992, 4.9990), 10),
            (book(4.9990, 4.9992, 4.9990), 10),
        ]);
        let venue = FakeVenue::new(World {
            open_ack: Some(Err(TradeError::Timeout)),
            open_fill_on_venue: 10.0, // the order landed despite the timeout
            close_fills: VecDeque::from([Ok(10.0)]),
            position_visible: true,
            ..World::default()
        });
        let settings = FunSettings::default();
        let inst = instrument();

        let outcome = run_orchestrator(&clock, &market, &venue, &settings, &inst)
            .run(PAYOUT_MS)
            .await;

        assert!(matches!(outcome, PayoutOutcome::Closed(_)));
        let orders = venue.orders();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[1].1.side, Side::Buy);
        assert_eq!(orders[1].1.qty, "10.00");
    }

    #[tokio::test]
    async fn conclusive_zero_fill_reports_no_fill() {
        let clock = FakeClock::starting_at(PAYOUT_MS - 2_000);
        let market = FakeMarket::scripted(vec![
            (book(5.0000, 5.0002, 5.0000), 10),
            (book(4.9990, 4.9992, 4.9990), 10),
        ]);
        let venue = FakeVenue::new(World {
            open_final: Some(Ok(OrderFinal {
                order_id: "open-1".to_string(),
                status: OrderStatus::Cancelled,
                filled_qty: 0.0,
                avg_price: None,
            })),
            position_visible: true,
            ..World::default()
        });
        let settings = FunSettings::default();
        let inst = instrument();

        let outcome = run_orchestrator(&clock, &market, &venue, &settings, &inst)
            .run(PAYOUT_MS)
            .await;

        assert_eq!(outcome, PayoutOutcome::NoFill);
        assert_eq!(venue.orders().len(), 1);
    }

    #[tokio::test]
    async fn close_succeeds_on_the_final_attempt() {
        let clock = FakeClock::starting_at(PAYOUT_MS - 2_000);
        let market = FakeMarket::scripted(vec![
            (book(5.0000, 5.0002, 5.0000), 10),
            (book(4.9990, 4.9992, 4.9990), 10),
        ]);
        let mut close_fills: VecDeque<Result<f64, WaitError>> =
            (0..14).map(|_| Ok(0.0)).collect();
        close_fills.push_back(Ok(10.0));
        let venue = FakeVenue::new(World {
            open_final: Some(Ok(OrderFinal {
                order_id: "open-1".to_string(),
                status: OrderStatus::Filled,
                filled_qty: 10.0,
                avg_price: Some(4.9987),
            })),
            open_fill_on_venue: 10.0,
            close_fills,
            position_visible: true,
            ..World::default()
        });
        let settings = FunSettings::default();
        let inst = instrument();

        let outcome = run_orchestrator(&clock, &market, &venue, &settings, &inst)
            .run(PAYOUT_MS)
            .await;

        assert!(matches!(outcome, PayoutOutcome::Closed(_)));
        // one open + fifteen close attempts
        assert_eq!(venue.orders().len(), 16);
    }

    #[tokio::test]
    async fn exhausted_close_budget_reports_residual() {
        let clock = FakeClock::starting_at(PAYOUT_MS - 2_000);
        let market = FakeMarket::scripted(vec![
            (book(5.0000, 5.0002, 5.0000), 10),
            (book(4.9990, 4.9992, 4.9990), 10),
        ]);
        let venue = FakeVenue::new(World {
            open_final: Some(Ok(OrderFinal {
                order_id: "open-1".to_string(),
                status: OrderStatus::Filled,
                filled_qty: 10.0,
                avg_price: Some(4.9987),
            })),
            open_fill_on_venue: 10.0,
            close_fills: (0..15).map(|_| Ok(0.0)).collect(),
            position_visible: true,
            ..World::default()
        });
        let settings = FunSettings::default();
        let inst = instrument();

        let outcome = run_orchestrator(&clock, &market, &venue, &settings, &inst)
            .run(PAYOUT_MS)
            .await;

        match outcome {
            PayoutOutcome::ResidualOpen { remaining, .. } => {
                assert!((remaining - 10.0).abs() < 1e-9);
            }
            other => panic!("expected ResidualOpen, got {other:?}"),
        }
        assert_eq!(venue.orders().len(), 16);
    }

    #[tokio::test]
    async fn rest_fallback_resolves_opened_qty() {
        let clock = FakeClock::starting_at(PAYOUT_MS - 2_000);
        let market = FakeMarket::scripted(vec![
            (book(5.0000, 5.0002, 5.0000), 10),
            (book(4.9990, 4.9992, 4.9990), 10),
        ]);
        // Ack times out, the position cache never reports, REST sees the
        // short. One close attempt flattens it.
        let venue = FakeVenue::new(World {
            open_ack: Some(Err(TradeError::Timeout)),
            open_fill_on_venue: 10.0,
            close_fills: VecDeque::from([Ok(10.0)]),
            position_visible: false,
            rest_short: Some(10.0),
            ..World::default()
        });
        let settings = FunSettings::default();
        let inst = instrument();

        let outcome = run_orchestrator(&clock, &market, &venue, &settings, &inst)
            .run(PAYOUT_MS)
            .await;

        assert!(matches!(outcome, PayoutOutcome::Closed(_)));
    }
}
