//! Prompt construction for the signal strategy

use std::fmt::Write;

use crate::types::{MarketCandle, MarketContext};

/// System instructions sent with every decision request
pub const SYSTEM_INSTRUCTIONS: &str = "You are a disciplined trading assistant for a long-only margin account. \
Given recent candles on two timeframes, the current position and the available balance, \
decide whether to BUY (open a long), SELL (close the open long) or HOLD. \
Answer with lines of the form KEY: value. The ACTION line is required and must be BUY, SELL or HOLD. \
Optional lines: LEVERAGE (integer), SIZE (percent of balance), TAKE_PROFIT (price), STOP_LOSS (price), REASON (one sentence). \
Do not add anything else.";

/// Render the market context as the user message
pub fn render(ctx: &MarketContext) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Pair: {}", ctx.pair);
    let _ = writeln!(out, "Time: {}", ctx.timestamp.to_rfc3339());
    let _ = writeln!(out, "Current price: {}", ctx.current_price);
    let _ = writeln!(out, "Available {} balance: {}", ctx.pair.to(), ctx.quote_balance);
    let _ = writeln!(out, "Maximum leverage: {}x", ctx.max_leverage);

    match &ctx.position {
        Some(position) if position.is_open() => {
            let _ = writeln!(
                out,
                "Open position: LONG {} @ {} ({}x)",
                position.quantity, position.entry_price, position.leverage
            );
        }
        _ => {
            let _ = writeln!(out, "Open position: none");
        }
    }

    write_candles(&mut out, ctx.primary_timeframe.as_str(), &ctx.primary);
    write_candles(&mut out, ctx.higher_timeframe.as_str(), &ctx.higher);
    out
}

fn write_candles(out: &mut String, timeframe: &str, candles: &[MarketCandle]) {
    let _ = writeln!(out);
    let _ = writeln!(out, "{} candles ({}), oldest first:", timeframe, candles.len());
    let _ = writeln!(out, "time,open,high,low,close,volume");
    for candle in candles {
        let _ = writeln!(
            out,
            "{},{},{},{},{},{}",
            candle.open_time.format("%Y-%m-%d %H:%M"),
            candle.open,
            candle.high,
            candle.low,
            candle.close,
            candle.volume
        );
    }
}
