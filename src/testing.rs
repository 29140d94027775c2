/// In-memory panel and notifier doubles for unit tests
use crate::{
    error::{BotError, BotResult},
    notify::Notifier,
    panel::{
        NormalizedUserRecord, Panel, PanelAdapter, PanelFailure, PanelLookup, PanelResult,
        UserChange,
    },
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub struct FakePanel {
    panel: Panel,
    users: Mutex<BTreeMap<String, NormalizedUserRecord>>,
    pub down: AtomicBool,
    pub reject_writes: AtomicBool,
    /// Pause between reading and writing a record, as a remote read-modify-write would
    pub slow_writes: AtomicBool,
}

impl FakePanel {
    pub fn new(panel: Panel) -> Self {
        Self {
            panel,
            users: Mutex::new(BTreeMap::new()),
            down: AtomicBool::new(false),
            reject_writes: AtomicBool::new(false),
            slow_writes: AtomicBool::new(false),
        }
    }

    pub fn insert(&self, record: NormalizedUserRecord) {
        self.users
            .lock()
            .unwrap()
            .insert(record.panel_key.clone(), record);
    }

    pub fn get(&self, key: &str) -> Option<NormalizedUserRecord> {
        self.users.lock().unwrap().get(key).cloned()
    }

    pub fn set_usage(&self, key: &str, usage_gb: f64) {
        let mut users = self.users.lock().unwrap();
        if let Some(record) = users.get_mut(key) {
            *record = rebuild(record, record.usage_limit_gb, usage_gb);
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }
}

fn rebuild(record: &NormalizedUserRecord, limit: f64, usage: f64) -> NormalizedUserRecord {
    NormalizedUserRecord::new(record.name.clone(), record.panel_key.clone(), limit, usage)
        .with_external_id(record.external_id.clone())
        .active(record.is_active)
        .last_online(record.last_online)
        .expire_days(record.expire_days)
}

#[async_trait]
impl PanelAdapter for FakePanel {
    fn panel(&self) -> Panel {
        self.panel
    }

    async fn fetch_all(&self) -> PanelResult<Vec<NormalizedUserRecord>> {
        if self.is_down() {
            return Err(PanelFailure::Unavailable("down".to_string()));
        }
        Ok(self.users.lock().unwrap().values().cloned().collect())
    }

    async fn fetch_one(&self, panel_key: &str) -> PanelLookup {
        if self.is_down() {
            return PanelLookup::Unavailable("down".to_string());
        }
        match self.get(panel_key) {
            Some(record) => PanelLookup::Found(record),
            None => PanelLookup::NotFound,
        }
    }

    async fn modify(&self, panel_key: &str, change: &UserChange) -> PanelResult<()> {
        if self.is_down() {
            return Err(PanelFailure::Unavailable("down".to_string()));
        }
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(PanelFailure::Rejected("status 500".to_string()));
        }

        let record = self.get(panel_key).ok_or(PanelFailure::NotFound)?;
        if self.slow_writes.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let limit = if record.is_unlimited() {
            record.usage_limit_gb
        } else {
            record.usage_limit_gb + change.add_usage_gb
        };
        let usage = if change.reset_usage { 0.0 } else { record.current_usage_gb };
        let mut updated = rebuild(&record, limit, usage);
        if let (Some(days), true) = (updated.expire_days, change.add_days != 0) {
            updated.expire_days = Some(days.max(0) + change.add_days);
        }
        if let Some(enable) = change.enable {
            updated.is_active = enable;
        }
        self.users
            .lock()
            .unwrap()
            .insert(panel_key.to_string(), updated);
        Ok(())
    }

    async fn delete(&self, panel_key: &str) -> PanelResult<()> {
        if self.is_down() {
            return Err(PanelFailure::Unavailable("down".to_string()));
        }
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(PanelFailure::Rejected("status 500".to_string()));
        }
        self.users
            .lock()
            .unwrap()
            .remove(panel_key)
            .map(|_| ())
            .ok_or(PanelFailure::NotFound)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(i64, String)>>,
    pub failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<(i64, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, recipient: i64, text: &str) -> BotResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BotError::Notification("blocked".to_string()));
        }
        self.sent.lock().unwrap().push((recipient, text.to_string()));
        Ok(())
    }
}
