//! Shared doubles for the integration scenarios
#![allow(dead_code)]

use async_trait::async_trait;
use dualpanel_bot::{
    config::BotConfig,
    context::AppContext,
    db::create_memory_pool,
    error::{BotError, BotResult},
    identity::IdentityMap,
    notify::Notifier,
    panel::{NormalizedUserRecord, Panel, PanelAdapter, PanelFailure, PanelLookup, PanelResult, UserChange},
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Panel backed by a map; writes apply the relative change in memory
pub struct StubPanel {
    panel: Panel,
    users: Mutex<BTreeMap<String, NormalizedUserRecord>>,
    pub fail_deletes: AtomicBool,
}

impl StubPanel {
    pub fn new(panel: Panel) -> Arc<Self> {
        Arc::new(Self {
            panel,
            users: Mutex::new(BTreeMap::new()),
            fail_deletes: AtomicBool::new(false),
        })
    }

    pub fn put(&self, record: NormalizedUserRecord) {
        self.users
            .lock()
            .unwrap()
            .insert(record.panel_key.clone(), record);
    }

    /// Replace the usage counter, keeping everything else
    pub fn set_usage(&self, key: &str, usage_gb: f64) {
        let mut users = self.users.lock().unwrap();
        if let Some(old) = users.get(key).cloned() {
            let updated = NormalizedUserRecord::new(old.name, old.panel_key, old.usage_limit_gb, usage_gb)
                .with_external_id(old.external_id)
                .active(old.is_active)
                .expire_days(old.expire_days);
            users.insert(key.to_string(), updated);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.users.lock().unwrap().contains_key(key)
    }
}

#[async_trait]
impl PanelAdapter for StubPanel {
    fn panel(&self) -> Panel {
        self.panel
    }

    async fn fetch_all(&self) -> PanelResult<Vec<NormalizedUserRecord>> {
        Ok(self.users.lock().unwrap().values().cloned().collect())
    }

    async fn fetch_one(&self, panel_key: &str) -> PanelLookup {
        match self.users.lock().unwrap().get(panel_key) {
            Some(record) => PanelLookup::Found(record.clone()),
            None => PanelLookup::NotFound,
        }
    }

    async fn modify(&self, panel_key: &str, change: &UserChange) -> PanelResult<()> {
        let mut users = self.users.lock().unwrap();
        let old = users.get(panel_key).cloned().ok_or(PanelFailure::NotFound)?;
        let usage = if change.reset_usage { 0.0 } else { old.current_usage_gb };
        let limit = if old.is_unlimited() {
            old.usage_limit_gb
        } else {
            old.usage_limit_gb + change.add_usage_gb
        };
        let updated = NormalizedUserRecord::new(old.name, old.panel_key, limit, usage)
            .with_external_id(old.external_id)
            .active(change.enable.unwrap_or(old.is_active))
            .expire_days(old.expire_days.map(|d| d.max(0) + change.add_days));
        users.insert(panel_key.to_string(), updated);
        Ok(())
    }

    async fn delete(&self, panel_key: &str) -> PanelResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(PanelFailure::Unavailable("connection reset".to_string()));
        }
        self.users
            .lock()
            .unwrap()
            .remove(panel_key)
            .map(|_| ())
            .ok_or(PanelFailure::NotFound)
    }
}

/// Notifier that keeps every accepted message
#[derive(Default)]
pub struct Outbox {
    pub messages: Mutex<Vec<(i64, String)>>,
    pub reject: AtomicBool,
}

impl Outbox {
    pub fn sent(&self) -> Vec<(i64, String)> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for Outbox {
    async fn send(&self, recipient: i64, text: &str) -> BotResult<()> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(BotError::Notification("rejected".to_string()));
        }
        self.messages.lock().unwrap().push((recipient, text.to_string()));
        Ok(())
    }
}

pub struct World {
    pub ctx: AppContext,
    pub hiddify: Arc<StubPanel>,
    pub marzban: Arc<StubPanel>,
    pub outbox: Arc<Outbox>,
}

/// Context over stub panels, an in-memory database and a UTC clock
pub async fn world(mapping: &[(&str, &str)]) -> World {
    let mut config = BotConfig::default();
    config.scheduler.timezone = "UTC".to_string();

    let hiddify = StubPanel::new(Panel::Hiddify);
    let marzban = StubPanel::new(Panel::Marzban);
    let outbox = Arc::new(Outbox::default());
    let identity = IdentityMap::from_entries(mapping.iter().map(|(id, user)| (*id, *user)));

    let ctx = AppContext::from_parts(
        config,
        create_memory_pool().await.expect("memory pool"),
        hiddify.clone(),
        marzban.clone(),
        Arc::new(identity),
        outbox.clone(),
    )
    .expect("context");

    World {
        ctx,
        hiddify,
        marzban,
        outbox,
    }
}

pub fn hiddify_user(uuid: &str, name: &str, limit: f64, usage: f64) -> NormalizedUserRecord {
    NormalizedUserRecord::new(name, uuid, limit, usage)
        .with_external_id(Some(uuid.to_string()))
        .active(true)
}

pub fn marzban_user(username: &str, limit: f64, usage: f64) -> NormalizedUserRecord {
    NormalizedUserRecord::new(username, username, limit, usage).active(true)
}
