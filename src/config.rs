//! Configuration management

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::gateway::DEFAULT_USER_AGENT;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Web application id sent with the ticket request
    #[serde(default = "default_app_id")]
    pub app_id: String,

    /// UI language sent as `lang`
    #[serde(default = "default_lang")]
    pub lang: String,

    /// Login host (ticket, confirmation poll and QR image)
    #[serde(default = "default_login_host")]
    pub login_host: String,

    /// User agent used by the default gateway
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Delay between two sync iterations
    #[serde(default = "default_sync_interval")]
    pub sync_interval_ms: u64,

    /// Client-side bound on one confirmation poll (the server holds ~25s)
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_secs: u64,

    /// Consecutive sync failures tolerated before the session is torn down
    #[serde(default = "default_max_sync_errors")]
    pub max_sync_errors: u32,

    /// Ticket reloads followed while waiting for the scan before giving up
    #[serde(default = "default_max_ticket_reloads")]
    pub max_ticket_reloads: u32,
}

fn default_app_id() -> String {
    "wx782c26e4c19acffb".to_string()
}

fn default_lang() -> String {
    "zh_CN".to_string()
}

fn default_login_host() -> String {
    "https://login.wx.qq.com".to_string()
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_sync_interval() -> u64 {
    1000
}

fn default_confirm_timeout() -> u64 {
    35
}

fn default_max_sync_errors() -> u32 {
    3
}

fn default_max_ticket_reloads() -> u32 {
    5
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            lang: default_lang(),
            login_host: default_login_host(),
            user_agent: default_user_agent(),
            sync_interval_ms: default_sync_interval(),
            confirm_timeout_secs: default_confirm_timeout(),
            max_sync_errors: default_max_sync_errors(),
            max_ticket_reloads: default_max_ticket_reloads(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        Ok(Self {
            app_id: std::env::var("WECHAT_APP_ID").unwrap_or_else(|_| default_app_id()),
            lang: std::env::var("WECHAT_LANG").unwrap_or_else(|_| default_lang()),
            login_host: std::env::var("WECHAT_LOGIN_HOST")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| default_login_host()),
            user_agent: std::env::var("WECHAT_USER_AGENT")
                .unwrap_or_else(|_| default_user_agent()),
            sync_interval_ms: std::env::var("WECHAT_SYNC_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_sync_interval),
            confirm_timeout_secs: std::env::var("WECHAT_CONFIRM_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_confirm_timeout),
            max_sync_errors: std::env::var("WECHAT_MAX_SYNC_ERRORS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_max_sync_errors),
            max_ticket_reloads: std::env::var("WECHAT_MAX_TICKET_RELOADS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_max_ticket_reloads),
        })
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    /// URL of the QR image a user scans for the given ticket
    pub fn qr_code_url(&self, uuid: &str) -> String {
        format!("{}/qrcode/{}", self.login_host, uuid)
    }
}

// =============================================================================
// Endpoint Map
// =============================================================================

/// Endpoint URLs, treated as opaque strings by the core
///
/// The login endpoints are known up front; everything else hangs off the
/// redirect target returned by the confirmation poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointMap {
    pub ticket: String,
    pub confirm: String,
    pub redirect: String,
    pub base_uri: String,
    pub init: String,
    pub status_notify: String,
    pub contact: String,
    pub batch_contact: String,
    pub sync_check: String,
    pub sync: String,
    pub send_msg: String,
    pub msg_image: String,
    pub voice: String,
    pub logout: String,
    /// Scheme and host prefixed to member `HeadImgUrl` paths
    pub head_image_origin: String,
}

impl EndpointMap {
    pub fn for_login_host(login_host: &str) -> Self {
        Self {
            ticket: format!("{}/jslogin", login_host),
            confirm: format!("{}/cgi-bin/mmwebwx-bin/login", login_host),
            ..Default::default()
        }
    }

    /// Derive the session endpoints from the confirmation redirect
    ///
    /// The push host serving `synccheck` depends on which web host the
    /// account was redirected to.
    pub fn apply_redirect(&mut self, redirect: &str) {
        let base_uri = match redirect.rfind('/') {
            Some(idx) => redirect[..idx].to_string(),
            None => redirect.to_string(),
        };
        let host = host_of(&base_uri);
        let origin = origin_of(&base_uri);

        let push_host = if host.contains("wx2.qq.com") {
            "webpush2.wx.qq.com"
        } else if host.contains("wx8.qq.com") {
            "webpush8.wx.qq.com"
        } else if host.contains("qq.com") {
            "webpush.wx.qq.com"
        } else if host.contains("web2.wechat.com") {
            "webpush2.web.wechat.com"
        } else if host.contains("wechat.com") {
            "webpush.web.wechat.com"
        } else {
            // Unknown host (tests, proxies): poll the web host itself
            host
        };

        self.redirect = redirect.to_string();
        self.init = format!("{}/webwxinit", base_uri);
        self.status_notify = format!("{}/webwxstatusnotify", base_uri);
        self.contact = format!("{}/webwxgetcontact", base_uri);
        self.batch_contact = format!("{}/webwxbatchgetcontact", base_uri);
        self.sync = format!("{}/webwxsync", base_uri);
        self.send_msg = format!("{}/webwxsendmsg", base_uri);
        self.msg_image = format!("{}/webwxgetmsgimg", base_uri);
        self.voice = format!("{}/webwxgetvoice", base_uri);
        self.logout = format!("{}/webwxlogout", base_uri);
        self.sync_check = format!(
            "{}://{}/cgi-bin/mmwebwx-bin/synccheck",
            scheme_of(&base_uri),
            push_host
        );
        self.head_image_origin = origin;
        self.base_uri = base_uri;
    }
}

fn scheme_of(url: &str) -> &str {
    url.split_once("://").map(|(scheme, _)| scheme).unwrap_or("https")
}

fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    rest.split('/').next().unwrap_or(rest)
}

fn origin_of(url: &str) -> String {
    format!("{}://{}", scheme_of(url), host_of(url))
}
