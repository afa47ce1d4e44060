//! Session state
//!
//! Credentials, device identity, sync cursor and lifecycle phase. The state
//! is crate-private: login and sync code mutate it, everything else reads
//! snapshots.

use rand::Rng;
use serde::Serialize;

use crate::types::SyncKey;

/// Lifecycle phase of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    AwaitingScan,
    Authenticated,
    Active,
    Terminated,
}

/// Minimal credential bundle attached to every authenticated request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BaseRequest {
    #[serde(rename = "Uin")]
    pub uin: i64,
    #[serde(rename = "Sid")]
    pub sid: String,
    #[serde(rename = "Skey")]
    pub skey: String,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
}

#[derive(Debug, Clone)]
pub(crate) struct SessionState {
    pub uuid: String,
    pub device_id: String,
    pub uin: String,
    pub sid: String,
    pub skey: String,
    pub pass_ticket: String,
    pub data_ticket: String,
    pub base_request: BaseRequest,
    sync_key: SyncKey,
    sync_cursor: String,
    pub phase: Phase,
    pub sync_error_count: u32,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            uuid: String::new(),
            device_id: generate_device_id(),
            uin: String::new(),
            sid: String::new(),
            skey: String::new(),
            pass_ticket: String::new(),
            data_ticket: String::new(),
            base_request: BaseRequest::default(),
            sync_key: SyncKey::default(),
            sync_cursor: String::new(),
            phase: Phase::Uninitialized,
            sync_error_count: 0,
        }
    }

    pub fn sync_key(&self) -> &SyncKey {
        &self.sync_key
    }

    pub fn sync_cursor(&self) -> &str {
        &self.sync_cursor
    }

    /// Replace the sync key and its formatted cursor together
    pub fn update_sync_key(&mut self, sync_key: SyncKey) {
        self.sync_cursor = sync_key.format();
        self.sync_key = sync_key;
    }

    /// Record a failed sync cycle, returning the consecutive count
    pub fn record_sync_error(&mut self) -> u32 {
        self.sync_error_count += 1;
        self.sync_error_count
    }

    pub fn reset_sync_errors(&mut self) {
        self.sync_error_count = 0;
    }

    /// Authenticated or active: a logout request is meaningful
    pub fn is_logged_in(&self) -> bool {
        matches!(self.phase, Phase::Authenticated | Phase::Active)
    }
}

/// `e` followed by 15 random digits
fn generate_device_id() -> String {
    let mut rng = rand::rng();
    let digits: String = (0..15)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect();
    format!("e{}", digits)
}
