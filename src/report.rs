/// Plain-text rendering of reports and warnings handed to the notifier
use crate::{
    panel::Panel,
    resolver::CombinedUserRecord,
    usage::PanelUsage,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write;

const SEPARATOR: &str = "-------------------------";
const TOP_CONSUMERS: usize = 5;

/// GB under 1 is shown in whole MB
pub fn format_daily_usage(gb: f64) -> String {
    if gb <= 0.0 || !gb.is_finite() {
        "0 MB".to_string()
    } else if gb < 1.0 {
        format!("{:.0} MB", gb * 1024.0)
    } else {
        format!("{:.2} GB", gb)
    }
}

pub fn format_expiry(expire_days: Option<i64>) -> String {
    match expire_days {
        None => "unlimited".to_string(),
        Some(days) if days < 0 => "expired".to_string(),
        Some(days) => format!("{} days", days),
    }
}

fn format_limit(limit_gb: f64) -> String {
    if limit_gb > 0.0 {
        format!("{:.2} GB", limit_gb)
    } else {
        "unlimited".to_string()
    }
}

/// Nightly report for one Telegram user
pub fn user_report(stamp: &str, accounts: &[(CombinedUserRecord, PanelUsage)]) -> String {
    let mut out = format!("Daily report - {}\n{}\n", stamp, SEPARATOR);

    if accounts.is_empty() {
        out.push_str("No account data could be fetched.");
        return out;
    }

    let mut total_today = 0.0;
    for (index, (record, today)) in accounts.iter().enumerate() {
        if index > 0 {
            out.push('\n');
        }
        total_today += today.total();

        let _ = writeln!(out, "Account: {}", record.name);
        let _ = writeln!(
            out,
            "  Total usage: {:.2} GB / {}",
            record.current_usage_gb,
            format_limit(record.usage_limit_gb)
        );
        for (panel, entry) in &record.breakdown {
            let _ = writeln!(
                out,
                "    {}: {:.2} GB / {}, today {}",
                panel,
                entry.current_usage_gb,
                format_limit(entry.usage_limit_gb),
                format_daily_usage(today.get(*panel))
            );
        }
        let _ = writeln!(out, "  Today: {}", format_daily_usage(today.total()));
        let _ = writeln!(out, "  Expires: {}", format_expiry(record.expire_days));
    }

    let _ = write!(out, "\nYour total usage today: {}", format_daily_usage(total_today));
    out
}

/// Aggregate view of every account for administrators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdminSummary {
    pub total_accounts: usize,
    pub hiddify_accounts: usize,
    pub marzban_accounts: usize,
    pub active: usize,
    pub online: usize,
    pub never_connected: usize,
    pub total_usage_gb: f64,
    pub today_hiddify_gb: f64,
    pub today_marzban_gb: f64,
    pub expiring_soon: Vec<(String, i64)>,
    pub top_consumers: Vec<(String, f64)>,
    pub unavailable: Vec<Panel>,
}

impl AdminSummary {
    /// `today` maps external ids of tracked accounts to their usage since start of day
    pub fn compute(
        records: &[CombinedUserRecord],
        unavailable: &[Panel],
        today: &HashMap<String, PanelUsage>,
        expiry_threshold_days: i64,
        now: DateTime<Utc>,
    ) -> Self {
        let mut summary = AdminSummary {
            total_accounts: records.len(),
            hiddify_accounts: 0,
            marzban_accounts: 0,
            active: 0,
            online: 0,
            never_connected: 0,
            total_usage_gb: 0.0,
            today_hiddify_gb: 0.0,
            today_marzban_gb: 0.0,
            expiring_soon: Vec::new(),
            top_consumers: Vec::new(),
            unavailable: unavailable.to_vec(),
        };

        for record in records {
            if record.panel(Panel::Hiddify).is_some() {
                summary.hiddify_accounts += 1;
            }
            if record.panel(Panel::Marzban).is_some() {
                summary.marzban_accounts += 1;
            }
            if record.is_active {
                summary.active += 1;
            }
            if record.is_online(now) {
                summary.online += 1;
            }
            if record.never_connected() {
                summary.never_connected += 1;
            }
            summary.total_usage_gb += record.current_usage_gb;

            if let Some(days) = record.expire_days {
                if (0..=expiry_threshold_days).contains(&days) {
                    summary.expiring_soon.push((record.name.clone(), days));
                }
            }

            if let Some(usage) = record.external_id.as_ref().and_then(|id| today.get(id)) {
                summary.today_hiddify_gb += usage.hiddify;
                summary.today_marzban_gb += usage.marzban;
                if usage.total() > 0.0 {
                    summary.top_consumers.push((record.name.clone(), usage.total()));
                }
            }
        }

        summary.expiring_soon.sort_by_key(|(_, days)| *days);
        summary
            .top_consumers
            .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        summary.top_consumers.truncate(TOP_CONSUMERS);
        summary
    }

    pub fn today_total(&self) -> f64 {
        self.today_hiddify_gb + self.today_marzban_gb
    }

    pub fn render(&self, stamp: &str) -> String {
        let mut out = format!("Admin summary - {}\n{}\n", stamp, SEPARATOR);
        let _ = writeln!(
            out,
            "Accounts: {} (hiddify {}, marzban {})",
            self.total_accounts, self.hiddify_accounts, self.marzban_accounts
        );
        let _ = writeln!(out, "Active: {}", self.active);
        let _ = writeln!(out, "Online now: {}", self.online);
        let _ = writeln!(out, "Never connected: {}", self.never_connected);
        let _ = writeln!(out, "Total usage: {:.2} GB", self.total_usage_gb);
        let _ = writeln!(
            out,
            "Usage today: {} (hiddify {}, marzban {})",
            format_daily_usage(self.today_total()),
            format_daily_usage(self.today_hiddify_gb),
            format_daily_usage(self.today_marzban_gb)
        );

        if !self.top_consumers.is_empty() {
            let _ = writeln!(out, "\nTop consumers today:");
            for (name, gb) in &self.top_consumers {
                let _ = writeln!(out, "  {}: {}", name, format_daily_usage(*gb));
            }
        }

        if !self.expiring_soon.is_empty() {
            let _ = writeln!(out, "\nExpiring soon:");
            for (name, days) in &self.expiring_soon {
                let _ = writeln!(out, "  {}: {} days", name, days);
            }
        }

        if !self.unavailable.is_empty() {
            let panels: Vec<&str> = self.unavailable.iter().map(|p| p.as_str()).collect();
            let _ = writeln!(out, "\nUnreachable panels: {}", panels.join(", "));
        }

        out.trim_end().to_string()
    }
}

pub fn expiry_warning(name: &str, days: i64) -> String {
    match days {
        0 => format!("Warning: account {} expires today.", name),
        1 => format!("Warning: account {} expires in 1 day.", name),
        _ => format!("Warning: account {} expires in {} days.", name, days),
    }
}

pub fn low_data_warning(name: &str, panel: Panel, remaining_gb: f64) -> String {
    format!(
        "Warning: account {} is running out of data on {}.\nRemaining: {:.2} GB",
        name, panel, remaining_gb
    )
}

pub fn birthday_message(gift_gb: f64, gift_days: i64) -> String {
    format!(
        "Happy birthday!\nWe wish you a year full of joy.\n\n\
         As a gift, {} GB and {} days were added to every one of your accounts.",
        format_gift_gb(gift_gb),
        gift_days
    )
}

fn format_gift_gb(gb: f64) -> String {
    if gb.fract() == 0.0 {
        format!("{:.0}", gb)
    } else {
        format!("{:.2}", gb)
    }
}
