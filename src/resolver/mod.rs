/// Combined-user resolver
///
/// Turns an identifier (external UUID or Marzban username) into one logical
/// account across both panels, and runs multi-panel writes with per-account
/// serialization and all-or-nothing local bookkeeping.

pub mod combined;
mod locks;

pub use combined::{combine, group_by_account, CombinedUserRecord};
pub use locks::AccountLocks;

use crate::{
    account::{is_external_id, AccountRegistry},
    error::{BotError, BotResult},
    identity::IdentityMap,
    panel::{NormalizedUserRecord, Panel, PanelAdapter, PanelFailure, PanelLookup, UserChange},
    usage::{SnapshotStore, WarningLog},
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Which panels a write applies to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanelTarget {
    Hiddify,
    Marzban,
    #[default]
    Both,
}

impl PanelTarget {
    pub fn includes(&self, panel: Panel) -> bool {
        match self {
            PanelTarget::Both => true,
            PanelTarget::Hiddify => panel == Panel::Hiddify,
            PanelTarget::Marzban => panel == Panel::Marzban,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanelStatus {
    Succeeded,
    Failed,
    /// Not targeted, or the account is not on that panel
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelOutcome {
    pub status: PanelStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PanelOutcome {
    fn succeeded() -> Self {
        Self {
            status: PanelStatus::Succeeded,
            detail: None,
        }
    }

    fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: PanelStatus::Failed,
            detail: Some(detail.into()),
        }
    }

    fn skipped(detail: &str) -> Self {
        Self {
            status: PanelStatus::Skipped,
            detail: Some(detail.to_string()),
        }
    }
}

/// Per-panel result of a multi-panel write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationReport {
    pub identifier: String,
    pub external_id: Option<String>,
    pub panels: BTreeMap<Panel, PanelOutcome>,
}

impl OperationReport {
    /// No targeted, present panel failed
    pub fn is_success(&self) -> bool {
        self.failed_panels().is_empty()
    }

    /// Some panels failed while at least one succeeded
    pub fn is_partial(&self) -> bool {
        !self.is_success()
            && self
                .panels
                .values()
                .any(|o| o.status == PanelStatus::Succeeded)
    }

    pub fn failed_panels(&self) -> Vec<Panel> {
        self.panels
            .iter()
            .filter(|(_, o)| o.status == PanelStatus::Failed)
            .map(|(p, _)| *p)
            .collect()
    }

    pub fn into_result(self) -> BotResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(BotError::PartialFailure {
                failed: self.failed_panels(),
            })
        }
    }
}

/// One search result; `matched_panels` lists the panels whose record matched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub record: CombinedUserRecord,
    pub matched_panels: Vec<Panel>,
}

/// Where an identifier lives, before any network call
#[derive(Debug, Clone)]
struct Plan {
    external_id: Option<String>,
    keys: BTreeMap<Panel, String>,
}

impl Plan {
    fn lock_key(&self) -> String {
        match (&self.external_id, self.keys.get(&Panel::Marzban)) {
            (Some(id), _) => id.clone(),
            (None, Some(username)) => format!("{}:{}", Panel::Marzban, username),
            (None, None) => String::new(),
        }
    }
}

/// Full lookup outcome, including panels that could not be asked
#[derive(Debug, Clone)]
pub struct Resolution {
    pub record: Option<CombinedUserRecord>,
    pub unavailable: Vec<(Panel, String)>,
    external_id: Option<String>,
    keys: BTreeMap<Panel, String>,
    found: BTreeMap<Panel, NormalizedUserRecord>,
}

/// `list_all` result; `unavailable` is kept even when no record came back
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub records: Vec<CombinedUserRecord>,
    pub unavailable: Vec<Panel>,
}

enum Action<'a> {
    Modify(&'a UserChange),
    Delete,
}

pub struct Resolver {
    hiddify: Arc<dyn PanelAdapter>,
    marzban: Arc<dyn PanelAdapter>,
    identity: Arc<IdentityMap>,
    accounts: AccountRegistry,
    snapshots: SnapshotStore,
    warnings: WarningLog,
    locks: AccountLocks,
}

impl Resolver {
    pub fn new(
        hiddify: Arc<dyn PanelAdapter>,
        marzban: Arc<dyn PanelAdapter>,
        identity: Arc<IdentityMap>,
        accounts: AccountRegistry,
        snapshots: SnapshotStore,
        warnings: WarningLog,
    ) -> Self {
        Self {
            hiddify,
            marzban,
            identity,
            accounts,
            snapshots,
            warnings,
            locks: AccountLocks::new(),
        }
    }

    fn adapter(&self, panel: Panel) -> &Arc<dyn PanelAdapter> {
        match panel {
            Panel::Hiddify => &self.hiddify,
            Panel::Marzban => &self.marzban,
        }
    }

    pub fn identity(&self) -> &Arc<IdentityMap> {
        &self.identity
    }

    fn plan(&self, identifier: &str) -> Plan {
        let identifier = identifier.trim();
        let mut keys = BTreeMap::new();

        if is_external_id(identifier) {
            let external_id = identifier.to_lowercase();
            for panel in Panel::ALL {
                if let Some(key) = self.identity.to_panel_key(&external_id, panel) {
                    keys.insert(panel, key);
                }
            }
            Plan {
                external_id: Some(external_id),
                keys,
            }
        } else {
            // Panel-native key: a Marzban username, optionally mapped back to an external id
            keys.insert(Panel::Marzban, identifier.to_string());
            let external_id = self.identity.to_external_id(identifier);
            if let Some(id) = &external_id {
                if let Some(key) = self.identity.to_panel_key(id, Panel::Hiddify) {
                    keys.insert(Panel::Hiddify, key);
                }
            }
            Plan { external_id, keys }
        }
    }

    async fn fetch(&self, plan: Plan) -> Resolution {
        let lookups = join_all(plan.keys.iter().map(|(panel, key)| async move {
            (*panel, self.adapter(*panel).fetch_one(key).await)
        }))
        .await;

        let mut found = BTreeMap::new();
        let mut unavailable = Vec::new();
        for (panel, lookup) in lookups {
            match lookup {
                PanelLookup::Found(mut record) => {
                    if record.external_id.is_none() {
                        record.external_id = plan.external_id.clone();
                    }
                    found.insert(panel, record);
                }
                PanelLookup::NotFound => {}
                PanelLookup::Unavailable(reason) => {
                    tracing::warn!("{} unavailable while resolving: {}", panel, reason);
                    unavailable.push((panel, reason));
                }
            }
        }

        let record = combine(found.clone()).map(|mut record| {
            record.unavailable = unavailable.iter().map(|(p, _)| *p).collect();
            record
        });

        Resolution {
            record,
            unavailable,
            external_id: plan.external_id,
            keys: plan.keys,
            found,
        }
    }

    /// Resolve with the unavailable-panel detail kept
    pub async fn resolve_detailed(&self, identifier: &str) -> Resolution {
        let plan = self.plan(identifier);
        self.fetch(plan).await
    }

    /// The combined account, or `None` when no reachable panel has it
    pub async fn resolve(&self, identifier: &str) -> Option<CombinedUserRecord> {
        self.resolve_detailed(identifier).await.record
    }

    /// Resolve or fail with `NotFound`/`PanelUnavailable`
    pub async fn require(&self, identifier: &str) -> BotResult<CombinedUserRecord> {
        let resolution = self.resolve_detailed(identifier).await;
        match (resolution.record, resolution.unavailable.into_iter().next()) {
            (Some(record), _) => Ok(record),
            (None, Some((panel, reason))) => Err(BotError::PanelUnavailable { panel, reason }),
            (None, None) => Err(BotError::NotFound(format!("User {}", identifier))),
        }
    }

    async fn fetch_all_panels(
        &self,
    ) -> (Vec<NormalizedUserRecord>, Vec<NormalizedUserRecord>, Vec<Panel>) {
        let (hiddify, marzban) = futures::join!(self.hiddify.fetch_all(), self.marzban.fetch_all());
        let mut unavailable = Vec::new();

        let mut take = |panel: Panel, result: Result<Vec<NormalizedUserRecord>, PanelFailure>| {
            result.unwrap_or_else(|failure| {
                tracing::error!("Could not list {} users: {}", panel, failure);
                unavailable.push(panel);
                Vec::new()
            })
        };
        let hiddify = take(Panel::Hiddify, hiddify);
        let mut marzban = take(Panel::Marzban, marzban);

        // Usernames the adapter could not map still group through the identity map
        for record in marzban.iter_mut().filter(|r| r.external_id.is_none()) {
            record.external_id = self.identity.to_external_id(&record.panel_key);
        }

        (hiddify, marzban, unavailable)
    }

    /// Every account on every panel, with the panels that could not be listed
    pub async fn list_all_detailed(&self) -> Listing {
        let (hiddify, marzban, unavailable) = self.fetch_all_panels().await;

        let records = group_by_account(hiddify, marzban)
            .into_iter()
            .filter_map(combine)
            .map(|mut record| {
                record.unavailable = unavailable.clone();
                record
            })
            .collect();
        Listing {
            records,
            unavailable,
        }
    }

    /// Every account on every panel, deduplicated by external id
    pub async fn list_all(&self) -> Vec<CombinedUserRecord> {
        self.list_all_detailed().await.records
    }

    /// Case-insensitive name match, or id/key substring match, across both panels
    pub async fn search(&self, query: &str) -> Vec<SearchHit> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }

        let (hiddify, marzban, unavailable) = self.fetch_all_panels().await;
        let matches = |record: &NormalizedUserRecord| {
            record.name.to_lowercase().contains(&needle)
                || record.panel_key.to_lowercase().contains(&needle)
                || record
                    .external_id
                    .as_deref()
                    .map(|id| id.contains(&needle))
                    .unwrap_or(false)
        };

        group_by_account(hiddify, marzban)
            .into_iter()
            .filter_map(|breakdown| {
                let matched_panels: Vec<Panel> = breakdown
                    .iter()
                    .filter(|(_, record)| matches(record))
                    .map(|(panel, _)| *panel)
                    .collect();
                if matched_panels.is_empty() {
                    return None;
                }
                combine(breakdown).map(|mut record| {
                    record.unavailable = unavailable.clone();
                    SearchHit {
                        record,
                        matched_panels,
                    }
                })
            })
            .collect()
    }

    /// Apply a change on the targeted panels hosting the account
    pub async fn modify_everywhere(
        &self,
        identifier: &str,
        change: &UserChange,
        target: PanelTarget,
    ) -> BotResult<OperationReport> {
        if change.is_empty() {
            return Err(BotError::Validation("Nothing to change".to_string()));
        }
        self.run(identifier, target, Action::Modify(change)).await
    }

    /// Zero the usage counters; snapshots are purged when every targeted panel succeeded
    pub async fn reset_usage(
        &self,
        identifier: &str,
        target: PanelTarget,
    ) -> BotResult<OperationReport> {
        let change = UserChange::reset();
        let report = self.run(identifier, target, Action::Modify(&change)).await?;

        if report.is_success() {
            if let Some(account) = self.tracked(report.external_id.as_deref()).await? {
                self.snapshots.purge(account.id).await?;
                self.warnings.clear(account.id).await?;
            }
        }
        Ok(report)
    }

    /// Delete from every panel; local tracking ends only if all deletions succeeded
    pub async fn delete_everywhere(&self, identifier: &str) -> BotResult<OperationReport> {
        let report = self.run(identifier, PanelTarget::Both, Action::Delete).await?;

        if report.is_success() {
            if let Some(account) = self.tracked(report.external_id.as_deref()).await? {
                self.accounts.deactivate(account.id).await?;
                self.snapshots.purge(account.id).await?;
                self.warnings.clear(account.id).await?;
            }
        } else {
            tracing::warn!(
                "Delete of {} incomplete (failed: {:?}); local tracking kept",
                identifier,
                report.failed_panels()
            );
        }
        Ok(report)
    }

    async fn tracked(
        &self,
        external_id: Option<&str>,
    ) -> BotResult<Option<crate::db::account::TrackedAccount>> {
        match external_id {
            Some(id) => self.accounts.get_by_external_id(id).await,
            None => Ok(None),
        }
    }

    async fn run(
        &self,
        identifier: &str,
        target: PanelTarget,
        action: Action<'_>,
    ) -> BotResult<OperationReport> {
        let plan = self.plan(identifier);
        let _guard = self.locks.acquire(&plan.lock_key()).await;

        let resolution = self.fetch(plan).await;
        if resolution.found.is_empty() {
            return match resolution.unavailable.into_iter().next() {
                Some((panel, reason)) => Err(BotError::PanelUnavailable { panel, reason }),
                None => Err(BotError::NotFound(format!("User {}", identifier))),
            };
        }

        let mut panels = BTreeMap::new();
        for panel in Panel::ALL {
            let outcome = if !target.includes(panel) {
                PanelOutcome::skipped("not targeted")
            } else if let Some((_, reason)) =
                resolution.unavailable.iter().find(|(p, _)| *p == panel)
            {
                PanelOutcome::failed(format!("unavailable: {}", reason))
            } else if let Some(record) = resolution.found.get(&panel) {
                let adapter = self.adapter(panel);
                let result = match &action {
                    Action::Modify(change) => adapter.modify(&record.panel_key, change).await,
                    Action::Delete => adapter.delete(&record.panel_key).await,
                };
                match result {
                    Ok(()) => PanelOutcome::succeeded(),
                    Err(failure) => {
                        tracing::error!(
                            "{} on {} failed for {}: {}",
                            action.name(),
                            panel,
                            identifier,
                            failure
                        );
                        PanelOutcome::failed(failure.to_string())
                    }
                }
            } else if resolution.keys.contains_key(&panel) {
                PanelOutcome::skipped("absent")
            } else {
                PanelOutcome::skipped("not mapped")
            };
            panels.insert(panel, outcome);
        }

        let report = OperationReport {
            identifier: identifier.to_string(),
            external_id: resolution.external_id,
            panels,
        };
        tracing::info!(
            "{} {}: {}",
            action.name(),
            identifier,
            if report.is_success() { "ok" } else { "incomplete" }
        );
        Ok(report)
    }
}

impl Action<'_> {
    fn name(&self) -> &'static str {
        match self {
            Action::Modify(change) if change.reset_usage => "reset",
            Action::Modify(_) => "modify",
            Action::Delete => "delete",
        }
    }
}
