use common::{ActionKind, NotifierEvent, TradeOutcome};

/// Render an event into the HTML message sent to the operator chat.
pub fn format_event(event: &NotifierEvent) -> String {
    match event {
        NotifierEvent::Started { active_positions } => format!(
            "🚀 <b>Position manager started</b>\n\
             Managing {active_positions} open position(s).\n\
             Dynamic two-tier stops and TP ladder armed."
        ),

        NotifierEvent::PositionAdopted { position } => {
            let mut msg = format!(
                "🆕 <b>Position adopted — {} {}</b>\n\
                 Qty:   <code>{:.6}</code>\n\
                 Entry: <code>{:.4}</code>\n\
                 Lev:   <code>{}x</code>",
                position.side, position.symbol, position.quantity, position.entry_price,
                position.leverage,
            );
            for level in &position.tp_levels {
                msg.push_str(&format!(
                    "\nTP{}:   <code>{:.4}</code> ({}%)",
                    level.index,
                    level.target_price,
                    level.close_fraction * 100.0
                ));
            }
            msg
        }

        NotifierEvent::ActionExecuted {
            position,
            action,
            fill_price,
            realized_pnl,
        } => {
            let emoji = match action.kind {
                ActionKind::PartialStopLoss => "🛡",
                ActionKind::FullStopLoss => "🔴",
                ActionKind::TakeProfit => "💰",
            };
            format!(
                "{emoji} <b>{} — {} {}</b>\n\
                 Qty:    <code>{:.6}</code>\n\
                 Price:  <code>{:.4}</code>\n\
                 PnL:    <code>{:+.4} USDT</code>\n\
                 Reason: {}",
                action.kind,
                position.side,
                position.symbol,
                action.quantity,
                fill_price,
                realized_pnl,
                action.reason,
            )
        }

        NotifierEvent::PositionClosed {
            symbol,
            outcome,
            realized_pnl,
        } => {
            let emoji = match outcome {
                TradeOutcome::Winning => "✅",
                TradeOutcome::Losing => "❌",
            };
            format!(
                "{emoji} <b>Position closed — {symbol}</b>\n\
                 Last fill PnL: <code>{realized_pnl:+.4} USDT</code>"
            )
        }

        NotifierEvent::ExternallyClosed { symbol } => format!(
            "📭 <b>{symbol}</b> was closed outside the manager, dropped from tracking."
        ),

        NotifierEvent::ManualClose { symbol, quantity } => format!(
            "🔄 <b>Manual close — {symbol}</b>\nQty: <code>{quantity:.6}</code>"
        ),

        NotifierEvent::SymbolDropped { symbol, error } => format!(
            "⚠️ <b>{symbol}</b> dropped after a persistent exchange error:\n<code>{error}</code>"
        ),

        NotifierEvent::MarginWarning { margin, threshold } => format!(
            "🚨 <b>Margin warning</b>\n\
             Ratio:     <code>{:.1}%</code> (threshold {:.0}%)\n\
             Available: <code>{:.2} USDT</code>\n\
             uPnL:      <code>{:+.2} USDT</code>",
            margin.margin_ratio * 100.0,
            threshold * 100.0,
            margin.available_balance,
            margin.unrealized_pnl,
        ),

        NotifierEvent::MarginFlatten { margin, positions } => format!(
            "🛑 <b>Margin critical — deleveraging</b>\n\
             Ratio: <code>{:.1}%</code>\n\
             Halved {positions} open position(s) with reduce-only closes.",
            margin.margin_ratio * 100.0,
        ),

        NotifierEvent::Report {
            stats,
            active_positions,
            generated_at,
        } => format!(
            "📊 <b>Performance report</b> — {}\n\
             Active:        <code>{active_positions}</code>\n\
             Managed total: <code>{}</code>\n\
             Wins/Losses:   <code>{}/{}</code> (WR {:.1}%)\n\
             Take-profits:  <code>{}</code>\n\
             Stop-losses:   <code>{}</code>\n\
             Partial stops: <code>{}</code>\n\
             Total PnL:     <code>{:+.4} USDT</code>",
            generated_at.format("%Y-%m-%d %H:%M UTC"),
            stats.total_managed,
            stats.winning_trades,
            stats.losing_trades,
            stats.win_rate(),
            stats.total_take_profits,
            stats.total_stop_losses,
            stats.total_partial_stops,
            stats.total_pnl,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::{ManagedPosition, PerformanceStats, PositionSide, PositionSnapshot};

    fn position() -> ManagedPosition {
        ManagedPosition::adopt(
            &PositionSnapshot {
                symbol: "BNBUSDT".into(),
                side: PositionSide::Long,
                quantity: 0.1,
                entry_price: 300.0,
                leverage: 10,
                unrealized_pnl: 0.0,
                liquidation_price: 0.0,
            },
            Vec::new(),
            Utc::now(),
        )
    }

    #[test]
    fn adopted_message_names_the_symbol_and_side() {
        let msg = format_event(&NotifierEvent::PositionAdopted { position: position() });
        assert!(msg.contains("BNBUSDT"));
        assert!(msg.contains("LONG"));
        assert!(msg.contains("300.0000"));
    }

    #[test]
    fn report_includes_win_rate() {
        let stats = PerformanceStats {
            total_managed: 4,
            winning_trades: 3,
            losing_trades: 1,
            ..Default::default()
        };
        let msg = format_event(&NotifierEvent::Report {
            stats,
            active_positions: 2,
            generated_at: Utc::now(),
        });
        assert!(msg.contains("WR 75.0%"));
    }

    #[test]
    fn outcome_picks_the_emoji() {
        let winning = format_event(&NotifierEvent::PositionClosed {
            symbol: "BNBUSDT".into(),
            outcome: TradeOutcome::Winning,
            realized_pnl: 1.25,
        });
        assert!(winning.starts_with("✅"));

        let losing = format_event(&NotifierEvent::PositionClosed {
            symbol: "BNBUSDT".into(),
            outcome: TradeOutcome::Losing,
            realized_pnl: -2.5,
        });
        assert!(losing.starts_with("❌"));
    }
}
