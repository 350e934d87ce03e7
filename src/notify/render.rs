//! Telegram HTML rendering of alerts, reports and system notices.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::alert::{Alert, ClassificationErrorAlert, FailedWithdrawAlert, LowBalanceAlert, StuckAlert};
use crate::notify::StartupInfo;
use crate::onchain::abi::WITHDRAW_SIGNATURE;
use crate::onchain::types::hex_hash;
use crate::report::DailyReport;

/// Failed transactions listed per chain in the daily report.
const REPORT_FAILED_LIMIT: usize = 5;

const TIME_FMT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// Escape text for Telegram's HTML parse mode.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Round to `dp` places and group thousands: `1234567.891` → `1,234,567.89`.
pub fn format_amount(value: Decimal, dp: u32) -> String {
    let rounded = value.round_dp(dp);
    let text = format!("{:.*}", dp as usize, rounded);
    let (sign, unsigned) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text.as_str()),
    };
    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (unsigned, None),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    match frac_part {
        Some(f) => format!("{sign}{grouped}.{f}"),
        None => format!("{sign}{grouped}"),
    }
}

fn short_hash(hash: &alloy::primitives::B256) -> String {
    let full = hex_hash(hash);
    format!("{}…", &full[..full.len().min(10)])
}

pub fn alert(alert: &Alert) -> String {
    match alert {
        Alert::FailedWithdraw(a) => failed_withdraw(a),
        Alert::LowBalance(a) => low_balance(a),
        Alert::Stuck(a) => stuck(a),
        Alert::ClassificationError(a) => classification_error(a),
    }
}

fn failed_withdraw(a: &FailedWithdrawAlert) -> String {
    let mut msg = format!(
        "🚨 <b>FAILED WITHDRAWAL DETECTED</b> 🚨\n\n\
         ⛓️ <b>Chain:</b> {}\n\
         📄 <b>Contract:</b> <code>{}</code>\n\
         🔧 <b>Function:</b> <code>{}</code>\n\
         🧾 <b>Transaction:</b> <code>{}</code>\n\
         📊 <b>Block:</b> {}",
        escape(&a.chain_name),
        a.contract,
        WITHDRAW_SIGNATURE,
        hex_hash(&a.tx_hash),
        a.block_number,
    );
    if let Some(t) = a.block_time {
        msg.push_str(&format!("\n⏰ <b>Time:</b> {}", t.format(TIME_FMT)));
    }
    if let Some(amount) = a.amount {
        msg.push_str(&format!("\n💰 <b>Amount:</b> {}", format_amount(amount, 6)));
    }
    if let Some(trader) = a.trader {
        msg.push_str(&format!("\n👤 <b>Trader:</b> <code>{trader}</code>"));
    }
    if let Some(id) = a.withdraw_id {
        msg.push_str(&format!("\n🆔 <b>Withdrawal ID:</b> {id}"));
    }
    if let Some(reason) = &a.decode_error {
        msg.push_str(&format!(
            "\n❔ <b>Arguments not decoded:</b> {}",
            escape(reason)
        ));
    }
    msg.push_str(&format!(
        "\n\n🔍 <a href=\"{}\">View transaction</a>\n\n\
         ⚠️ <b>Action Required:</b> Please investigate this failed withdrawal immediately.",
        escape(&a.explorer_link)
    ));
    msg
}

fn low_balance(a: &LowBalanceAlert) -> String {
    let (icon, status) = if a.critical {
        ("🆘", "CRITICAL, far below threshold")
    } else {
        ("🔴", "Below threshold")
    };
    let token = escape(&a.token_symbol);
    let token_line = match a.token_address {
        Some(addr) => format!("{token} (<code>{addr}</code>)"),
        None => format!("{token} (native)"),
    };
    format!(
        "{icon} <b>LOW BALANCE ALERT</b> {icon}\n\n\
         ⛓️ <b>Chain:</b> {}\n\
         📄 <b>Contract:</b> <code>{}</code>\n\
         🪙 <b>Token:</b> {token_line}\n\
         💰 <b>Current Balance:</b> {} {token}\n\
         ⚠️ <b>Threshold:</b> {} {token}\n\
         📉 <b>Status:</b> {status}\n\n\
         🔍 <a href=\"{}\">View contract</a>",
        escape(&a.chain_name),
        a.contract,
        format_amount(a.balance, 0),
        format_amount(a.threshold, 0),
        escape(&a.explorer_link),
    )
}

fn stuck(a: &StuckAlert) -> String {
    format!(
        "⏳ <b>WITHDRAWAL PENDING TOO LONG</b>\n\n\
         ⛓️ <b>Chain:</b> {}\n\
         🧾 <b>Transaction:</b> <code>{}</code>\n\
         📊 <b>Block:</b> {}\n\
         ⌛ <b>Pending for:</b> {}h\n\n\
         🔍 <a href=\"{}\">View transaction</a>",
        escape(&a.chain_name),
        hex_hash(&a.tx_hash),
        a.block_number,
        a.pending_hours,
        escape(&a.explorer_link),
    )
}

fn classification_error(a: &ClassificationErrorAlert) -> String {
    format!(
        "⚠️ <b>UNREADABLE RECEIPT</b>\n\n\
         ⛓️ <b>Chain:</b> {}\n\
         🧾 <b>Transaction:</b> <code>{}</code>\n\
         ❌ <b>Reason:</b> {}\n\n\
         The call will be re-checked every cycle.\n\
         🔍 <a href=\"{}\">View transaction</a>",
        escape(&a.chain_name),
        hex_hash(&a.tx_hash),
        escape(&a.reason),
        escape(&a.explorer_link),
    )
}

pub fn report(report: &DailyReport) -> String {
    let mut msg = format!(
        "📊 <b>DAILY WITHDRAWAL REPORT</b> 📊\n📅 <b>Date:</b> {}\n\n",
        report.date
    );

    for chain in &report.chains {
        msg.push_str(&format!("<b>{}</b>\n", escape(&chain.chain_name)));
        msg.push_str(&format!(
            "✅ Successful: {} ({})\n",
            chain.success.count,
            format_amount(chain.success.amount_sum, 2)
        ));
        msg.push_str(&format!(
            "❌ Failed: {} ({})\n",
            chain.failed.count,
            format_amount(chain.failed.amount_sum, 2)
        ));
        if chain.pending_count > 0 {
            msg.push_str(&format!("⏳ Pending: {}\n", chain.pending_count));
        }
        if chain.amount_unknown_count > 0 {
            msg.push_str(&format!("❔ Amount unknown: {}\n", chain.amount_unknown_count));
        }
        if !chain.failed_list.is_empty() {
            msg.push_str("Failed transactions:\n");
            for entry in chain.failed_list.iter().take(REPORT_FAILED_LIMIT) {
                msg.push_str(&format!(
                    "  • <a href=\"{}\">{}</a> block {}\n",
                    escape(&entry.explorer_link),
                    short_hash(&entry.tx_hash),
                    entry.block_number
                ));
            }
            if chain.failed_list.len() > REPORT_FAILED_LIMIT {
                msg.push_str(&format!(
                    "  … and {} more\n",
                    chain.failed_list.len() - REPORT_FAILED_LIMIT
                ));
            }
        }
        msg.push('\n');
    }

    let t = &report.totals;
    msg.push_str("📈 <b>TOTAL SUMMARY</b>\n");
    msg.push_str(&format!(
        "✅ Total Successful: {} ({})\n",
        t.success_count,
        format_amount(t.success_amount_sum, 2)
    ));
    msg.push_str(&format!(
        "❌ Total Failed: {} ({})\n",
        t.failed_count,
        format_amount(t.failed_amount_sum, 2)
    ));
    if t.pending_count > 0 {
        msg.push_str(&format!("⏳ Total Pending: {}\n", t.pending_count));
    }

    let with_balances: Vec<_> = report.chains.iter().filter(|c| !c.balances.is_empty()).collect();
    if !with_balances.is_empty() {
        msg.push_str(&format!(
            "\n💰 <b>BALANCES</b> (as of {})\n",
            report.cutoff.format("%Y-%m-%d %H:%M UTC")
        ));
        for chain in with_balances {
            msg.push_str(&format!("<b>{}</b>\n", escape(&chain.chain_name)));
            for b in &chain.balances {
                let icon = if b.critical {
                    "🆘"
                } else if b.below_threshold {
                    "🔴"
                } else {
                    "🟢"
                };
                msg.push_str(&format!(
                    "  {icon} {}: {}\n",
                    escape(&b.token_symbol),
                    format_amount(b.amount, 0)
                ));
            }
        }
    }
    msg
}

pub fn startup(info: &StartupInfo) -> String {
    let chains: Vec<String> = info.chains.iter().map(|c| escape(c)).collect();
    format!(
        "🚀 <b>WITHDRAWAL MONITOR STARTED</b>\n\n\
         ⏰ <b>Started at:</b> {}\n\n\
         🔍 <b>Monitoring:</b>\n\
         • Failed withdrawal transactions\n\
         • Low balance alerts\n\
         • Daily reporting at {} UTC\n\n\
         📊 <b>Configuration:</b>\n\
         • Polling interval: {} minutes\n\
         • Balance check interval: {} minutes\n\
         • Chains: {}",
        info.started_at.format(TIME_FMT),
        escape(&info.report_time_utc),
        info.poll_interval_minutes,
        info.balance_check_interval_minutes,
        chains.join(", "),
    )
}

pub fn system_error(component: &str, message: &str, at: DateTime<Utc>) -> String {
    format!(
        "⚠️ <b>SYSTEM ERROR</b> ⚠️\n\n\
         🔧 <b>Component:</b> {}\n\
         ⏰ <b>Time:</b> {}\n\n\
         ❌ <b>Error:</b> {}\n\n\
         🔍 Please check the logs for more details.",
        escape(component),
        at.format(TIME_FMT),
        escape(message),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, B256, U256};
    use std::str::FromStr;

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(Decimal::from_str("1234567.891").unwrap(), 2), "1,234,567.89");
        assert_eq!(format_amount(Decimal::from(8500), 0), "8,500");
        assert_eq!(format_amount(Decimal::from(999), 0), "999");
        assert_eq!(format_amount(Decimal::from_str("-1000.5").unwrap(), 1), "-1,000.5");
        assert_eq!(format_amount(Decimal::from_str("0.1").unwrap(), 6), "0.100000");
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
    }

    #[test]
    fn test_failed_withdraw_message() {
        let a = Alert::FailedWithdraw(FailedWithdrawAlert {
            chain_id: 1,
            chain_name: "Ethereum".into(),
            contract: Address::repeat_byte(0x11),
            tx_hash: B256::repeat_byte(0xab),
            block_number: 19_000_000,
            block_time: None,
            withdraw_id: Some(U256::from(42u8)),
            trader: None,
            amount: Some(Decimal::from(50)),
            decode_error: None,
            explorer_link: "https://etherscan.io/tx/0xab".into(),
        });
        let text = alert(&a);
        assert!(text.contains("FAILED WITHDRAWAL DETECTED"));
        assert!(text.contains("50.000000"));
        assert!(text.contains("Withdrawal ID:</b> 42"));
        assert!(text.contains("href=\"https://etherscan.io/tx/0xab\""));
    }

    #[test]
    fn test_low_balance_message_marks_critical() {
        let mut a = LowBalanceAlert {
            chain_id: 1,
            chain_name: "Ethereum".into(),
            contract: Address::repeat_byte(0x11),
            token_symbol: "USDT".into(),
            token_address: Some(Address::repeat_byte(0x55)),
            balance: Decimal::from(8500),
            threshold: Decimal::from(10_000),
            critical: false,
            explorer_link: "https://etherscan.io/address/0x11".into(),
        };
        let text = alert(&Alert::LowBalance(a.clone()));
        assert!(text.contains("LOW BALANCE"));
        assert!(text.contains("8,500 USDT"));
        assert!(!text.contains("CRITICAL"));

        a.critical = true;
        assert!(alert(&Alert::LowBalance(a)).contains("CRITICAL"));
    }
}
