use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};

use funbot::account::{AccountHandle, PrivateStream};
use funbot::clock::{self, ServerClock};
use funbot::config::{AppConfig, Credentials, FunSettings, TradeCommand};
use funbot::exchange::BybitRest;
use funbot::marketdata::{MarketHandle, PublicStream};
use funbot::orchestrator::{Orchestrator, PayoutOutcome, TradeChannel};
use funbot::preflight::{self, PreflightReport};
use funbot::telemetry;
use funbot::tradews::TradeWs;

const USAGE: &str = "usage: fun \"<SYMBOL> <EXCHANGE> <QTY> <FUNDING_PCT>\" [config.toml]\n       e.g. fun \"LPT Bybit 10 -0.1%\"";

const CLOCK_PROBES: usize = 5;
const READY_POLL_MS: u64 = 50;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(2)
        }
    }
}

/// Returns `Err` only for configurational failures (bad command, missing
/// credentials); in-window trouble is logged and exits clean.
async fn run(args: Vec<String>) -> Result<()> {
    let (command, config_path) = split_args(&args)?;

    let cmd = TradeCommand::parse(&command)?;
    if cmd.exchange != "bybit" {
        bail!("only bybit is supported, got '{}'", cmd.exchange);
    }
    if cmd.funding_pct >= 0.0 {
        bail!(
            "funding must be negative for a short harvest, got {}%",
            cmd.funding_pct * 100.0
        );
    }

    let app_cfg = match &config_path {
        Some(path) => AppConfig::load_from_path(path)
            .with_context(|| format!("failed to load config from {path}"))?,
        None => AppConfig::default(),
    };
    let settings = FunSettings::from_env();

    let mut guard = telemetry::init("fun", Some(&app_cfg.logging.log_file));
    info!(
        symbol = %cmd.symbol,
        qty = cmd.qty,
        funding_pct = cmd.funding_pct,
        use_trade_ws = settings.use_trade_ws,
        "starting fun"
    );

    let creds = Credentials::from_env()?;
    let rest = BybitRest::new(&app_cfg.bybit, &creds).context("failed to build rest client")?;

    if let Err(trade_error) = trade_once(&rest, &app_cfg, &settings, &creds, &cmd).await {
        error!(error = %format!("{trade_error:#}"), "payout aborted");
    }

    guard.drain();
    Ok(())
}

async fn trade_once(
    rest: &BybitRest,
    app_cfg: &AppConfig,
    settings: &FunSettings,
    creds: &Credentials,
    cmd: &TradeCommand,
) -> Result<()> {
    let funding = rest
        .funding_info(&cmd.symbol)
        .await
        .context("failed to resolve funding info")?;
    let payout_server_ms = funding.next_funding_time_ms;
    info!(
        exchange_funding_rate = funding.funding_rate,
        payout_server_ms,
        "next funding payout"
    );

    let server_clock = clock::estimate_offset(rest, CLOCK_PROBES)
        .await
        .context("failed to estimate server clock")?;
    info!(offset_ms = server_clock.offset_ms(), "server clock fixed");

    if server_clock.now_server_ms() > payout_server_ms + settings.late_tol_ms() {
        bail!("started too late relative to the payout (server time)");
    }

    let market = PublicStream::from_config(cmd.symbol.clone(), &app_cfg.bybit).spawn();
    let account = PrivateStream::from_config(&app_cfg.bybit, creds)
        .connect()
        .await
        .context("failed to start private stream")?;
    let trade_ws = if settings.use_trade_ws {
        Some(
            TradeWs::from_config(&app_cfg.bybit, creds)
                .connect()
                .await
                .context("failed to start trade channel")?,
        )
    } else {
        info!("trade websocket disabled; orders go over rest");
        None
    };

    let result = payout_pipeline(
        rest,
        settings,
        cmd,
        &server_clock,
        &market,
        &account,
        trade_ws.as_ref(),
        payout_server_ms,
        funding.last_price,
    )
    .await;

    if let Some(trade) = &trade_ws {
        trade.stop();
    }
    account.stop();
    market.stop();
    result
}

#[allow(clippy::too_many_arguments)]
async fn payout_pipeline(
    rest: &BybitRest,
    settings: &FunSettings,
    cmd: &TradeCommand,
    server_clock: &ServerClock,
    market: &MarketHandle,
    account: &AccountHandle,
    trade_ws: Option<&funbot::tradews::TradeHandle>,
    payout_server_ms: i64,
    last_price_hint: Option<f64>,
) -> Result<()> {
    let prep_server_ms =
        payout_server_ms - (settings.fast_prep_lead_sec.max(0.0) * 1_000.0) as i64;
    server_clock.sleep_until_server_ms(prep_server_ms).await;

    let price_hint = market
        .snapshot()
        .0
        .last_price()
        .or(last_price_hint)
        .filter(|px| *px > 0.0)
        .context("no price available for preflight")?;

    let report = preflight::run(rest, settings, &cmd.symbol, cmd.qty, price_hint)
        .await
        .context("preflight failed")?;

    wait_market_ready(market, server_clock, payout_server_ms, settings).await;

    let outcome = match trade_ws {
        Some(trade) => {
            run_orchestrator(
                trade,
                rest,
                settings,
                server_clock,
                market,
                account,
                &report,
                cmd.funding_pct,
                payout_server_ms,
            )
            .await
        }
        None => {
            run_orchestrator(
                rest,
                rest,
                settings,
                server_clock,
                market,
                account,
                &report,
                cmd.funding_pct,
                payout_server_ms,
            )
            .await
        }
    };

    match &outcome {
        PayoutOutcome::SkipStale => warn!("skipped: stale market data"),
        PayoutOutcome::SkipDown { down_bps } => {
            warn!(down_bps, "skipped: bid dropped past the admission plan")
        }
        PayoutOutcome::NoFill => info!("no position was opened"),
        PayoutOutcome::Closed(_) => info!("round trip complete"),
        PayoutOutcome::ResidualOpen { remaining, .. } => {
            error!(remaining, "residual short remains; intervene manually")
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_orchestrator<T: TradeChannel>(
    trade: &T,
    rest: &BybitRest,
    settings: &FunSettings,
    server_clock: &ServerClock,
    market: &MarketHandle,
    account: &AccountHandle,
    report: &PreflightReport,
    funding_pct: f64,
    payout_server_ms: i64,
) -> PayoutOutcome {
    let orchestrator = Orchestrator {
        clock: server_clock,
        market,
        account,
        trade,
        fallback: rest,
        settings,
        instrument: &report.instrument,
        qty_str: report.qty_str.clone(),
        funding_pct,
        short_before: report.short_before,
        position_idx: 0,
    };
    orchestrator.run(payout_server_ms).await
}

async fn wait_market_ready(
    market: &MarketHandle,
    server_clock: &ServerClock,
    payout_server_ms: i64,
    settings: &FunSettings,
) {
    let give_up_ms = payout_server_ms - settings.ws_fix_lead_ms() - 100;
    while !market.ready() {
        if server_clock.now_server_ms() >= give_up_ms {
            warn!("market stream not ready before the fix; the fix step will skip");
            return;
        }
        tokio::time::sleep(Duration::from_millis(READY_POLL_MS)).await;
    }
}

fn split_args(args: &[String]) -> Result<(String, Option<String>)> {
    match args.len() {
        1 => Ok((args[0].clone(), None)),
        2 => Ok((args[0].clone(), Some(args[1].clone()))),
        4 => Ok((args.join(" "), None)),
        5 => Ok((args[..4].join(" "), Some(args[4].clone()))),
        _ => bail!("{USAGE}"),
    }
}
