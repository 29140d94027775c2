/// Combined (cross-panel) account view and the pure merge that builds it
use crate::{
    panel::{remaining_gb, usage_percentage, NormalizedUserRecord, Panel},
    usage::PanelUsage,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Seen this recently counts as online
pub const ONLINE_WINDOW_MINUTES: i64 = 3;

/// One logical account across every panel hosting it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedUserRecord {
    pub name: String,
    pub external_id: Option<String>,
    pub is_active: bool,
    pub usage_limit_gb: f64,
    pub current_usage_gb: f64,
    pub remaining_gb: f64,
    pub usage_percentage: f64,
    pub last_online: Option<DateTime<Utc>>,
    pub expire_days: Option<i64>,
    pub breakdown: BTreeMap<Panel, NormalizedUserRecord>,
    /// Panels that could not be asked; absence there is unknown, not confirmed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unavailable: Vec<Panel>,
}

impl CombinedUserRecord {
    pub fn panel(&self, panel: Panel) -> Option<&NormalizedUserRecord> {
        self.breakdown.get(&panel)
    }

    pub fn panels(&self) -> Vec<Panel> {
        self.breakdown.keys().copied().collect()
    }

    /// Absolute per-panel usage counters, 0 where the panel is absent
    pub fn usage(&self) -> PanelUsage {
        let get = |panel| self.panel(panel).map(|r| r.current_usage_gb).unwrap_or(0.0);
        PanelUsage::new(get(Panel::Hiddify), get(Panel::Marzban))
    }

    pub fn is_complete(&self) -> bool {
        self.unavailable.is_empty()
    }

    pub fn is_online(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self
                .last_online
                .map(|seen| now - seen <= Duration::minutes(ONLINE_WINDOW_MINUTES))
                .unwrap_or(false)
    }

    pub fn never_connected(&self) -> bool {
        self.last_online.is_none()
    }

    /// Key used to dedupe and lock: the external id, or the panel key when unmapped
    pub fn identity_key(&self) -> String {
        match (&self.external_id, self.breakdown.iter().next()) {
            (Some(id), _) => id.clone(),
            (None, Some((panel, record))) => format!("{}:{}", panel, record.panel_key),
            (None, None) => String::new(),
        }
    }
}

/// Merge per-panel records. `None` when the account is on no panel.
///
/// With one panel the record is passed through unchanged. With several,
/// quota and usage are summed, `last_online` is the latest, `expire_days` the
/// soonest finite one and the account is active if any panel says so. The
/// Hiddify name wins since that panel provisions accounts first.
pub fn combine(breakdown: BTreeMap<Panel, NormalizedUserRecord>) -> Option<CombinedUserRecord> {
    let first = breakdown.values().next()?.clone();

    if breakdown.len() == 1 {
        return Some(CombinedUserRecord {
            name: first.name,
            external_id: first.external_id,
            is_active: first.is_active,
            usage_limit_gb: first.usage_limit_gb,
            current_usage_gb: first.current_usage_gb,
            remaining_gb: first.remaining_gb,
            usage_percentage: first.usage_percentage,
            last_online: first.last_online,
            expire_days: first.expire_days,
            breakdown,
            unavailable: Vec::new(),
        });
    }

    let name = Panel::ALL
        .iter()
        .filter_map(|p| breakdown.get(p))
        .map(|r| r.name.as_str())
        .find(|n| !n.is_empty())
        .unwrap_or_default()
        .to_string();
    let external_id = Panel::ALL
        .iter()
        .filter_map(|p| breakdown.get(p))
        .find_map(|r| r.external_id.clone());

    let usage_limit_gb: f64 = breakdown.values().map(|r| r.usage_limit_gb).sum();
    let current_usage_gb: f64 = breakdown.values().map(|r| r.current_usage_gb).sum();
    let last_online = breakdown.values().filter_map(|r| r.last_online).max();
    let expire_days = breakdown.values().filter_map(|r| r.expire_days).min();
    let is_active = breakdown.values().any(|r| r.is_active);

    Some(CombinedUserRecord {
        name,
        external_id,
        is_active,
        usage_limit_gb,
        current_usage_gb,
        remaining_gb: remaining_gb(usage_limit_gb, current_usage_gb),
        usage_percentage: usage_percentage(usage_limit_gb, current_usage_gb),
        last_online,
        expire_days,
        breakdown,
        unavailable: Vec::new(),
    })
}

/// Group two panel listings into per-account breakdowns, keyed by external id.
/// Order follows the Hiddify listing, then Marzban-only accounts.
pub fn group_by_account(
    hiddify: Vec<NormalizedUserRecord>,
    marzban: Vec<NormalizedUserRecord>,
) -> Vec<BTreeMap<Panel, NormalizedUserRecord>> {
    let mut groups: Vec<BTreeMap<Panel, NormalizedUserRecord>> = Vec::new();
    let mut index: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for (panel, records) in [(Panel::Hiddify, hiddify), (Panel::Marzban, marzban)] {
        for record in records {
            let key = record
                .external_id
                .clone()
                .unwrap_or_else(|| format!("{}:{}", panel, record.panel_key));
            match index.get(&key).copied() {
                Some(slot) if !groups[slot].contains_key(&panel) => {
                    groups[slot].insert(panel, record);
                }
                Some(_) => {
                    tracing::warn!("Duplicate {} record for {}; keeping the first", panel, key);
                }
                None => {
                    index.insert(key, groups.len());
                    groups.push(BTreeMap::from([(panel, record)]));
                }
            }
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const EPSILON: f64 = 1e-9;

    fn hiddify(limit: f64, usage: f64) -> NormalizedUserRecord {
        NormalizedUserRecord::new("A", "aaaa", limit, usage)
            .with_external_id(Some("aaaa".to_string()))
            .active(false)
            .expire_days(Some(20))
    }

    fn marzban(limit: f64, usage: f64) -> NormalizedUserRecord {
        NormalizedUserRecord::new("a_marz", "a_marz", limit, usage)
            .with_external_id(Some("aaaa".to_string()))
            .active(true)
            .expire_days(Some(5))
    }

    #[test]
    fn test_combined_totals() {
        let combined = combine(BTreeMap::from([
            (Panel::Hiddify, hiddify(50.0, 10.0)),
            (Panel::Marzban, marzban(30.0, 5.0)),
        ]))
        .unwrap();

        assert!((combined.usage_limit_gb - 80.0).abs() < EPSILON);
        assert!((combined.current_usage_gb - 15.0).abs() < EPSILON);
        assert!((combined.remaining_gb - 65.0).abs() < EPSILON);
        assert!((combined.usage_percentage - 18.75).abs() < EPSILON);
        assert_eq!(combined.name, "A");
        assert!(combined.is_active);
        assert_eq!(combined.expire_days, Some(5));
        assert_eq!(combined.external_id.as_deref(), Some("aaaa"));
    }

    #[test]
    fn test_totals_equal_breakdown_sums() {
        for (hl, hu, ml, mu) in [(0.0, 3.0, 10.0, 1.0), (7.5, 9.0, 0.0, 0.0), (1.0, 0.5, 2.0, 2.5)] {
            let combined = combine(BTreeMap::from([
                (Panel::Hiddify, hiddify(hl, hu)),
                (Panel::Marzban, marzban(ml, mu)),
            ]))
            .unwrap();
            let h = combined.panel(Panel::Hiddify).unwrap();
            let m = combined.panel(Panel::Marzban).unwrap();
            assert!((combined.usage_limit_gb - (h.usage_limit_gb + m.usage_limit_gb)).abs() < EPSILON);
            assert!((combined.current_usage_gb - (h.current_usage_gb + m.current_usage_gb)).abs() < EPSILON);
        }
    }

    #[test]
    fn test_single_panel_passthrough() {
        let only = marzban(30.0, 12.0).last_online(Some(Utc::now()));
        let combined = combine(BTreeMap::from([(Panel::Marzban, only.clone())])).unwrap();

        assert_eq!(combined.name, only.name);
        assert_eq!(combined.is_active, only.is_active);
        assert_eq!(combined.usage_limit_gb, only.usage_limit_gb);
        assert_eq!(combined.current_usage_gb, only.current_usage_gb);
        assert_eq!(combined.remaining_gb, only.remaining_gb);
        assert_eq!(combined.usage_percentage, only.usage_percentage);
        assert_eq!(combined.last_online, only.last_online);
        assert_eq!(combined.expire_days, only.expire_days);
        assert_eq!(combined.panels(), vec![Panel::Marzban]);
    }

    #[test]
    fn test_empty_breakdown_is_none() {
        assert!(combine(BTreeMap::new()).is_none());
    }

    #[test]
    fn test_last_online_null_loses() {
        let seen = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let combined = combine(BTreeMap::from([
            (Panel::Hiddify, hiddify(1.0, 0.0)),
            (Panel::Marzban, marzban(1.0, 0.0).last_online(Some(seen))),
        ]))
        .unwrap();
        assert_eq!(combined.last_online, Some(seen));
    }

    #[test]
    fn test_online_window() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let record = combine(BTreeMap::from([(
            Panel::Marzban,
            marzban(1.0, 0.0).last_online(Some(now - Duration::minutes(2))),
        )]))
        .unwrap();
        assert!(record.is_online(now));
        assert!(!record.is_online(now + Duration::minutes(5)));
    }

    #[test]
    fn test_group_by_account_dedupes() {
        let unmapped = NormalizedUserRecord::new("solo", "solo", 1.0, 0.0);
        let groups = group_by_account(
            vec![hiddify(1.0, 0.0)],
            vec![marzban(1.0, 0.0), unmapped],
        );

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert!(groups[1].contains_key(&Panel::Marzban));
    }
}
