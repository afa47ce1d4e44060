//! WeChat Web Client Library
//!
//! A headless client for the WeChat Web protocol: QR login, contact
//! directory, long-poll message sync and outgoing text messages.
//!
//! # Architecture
//!
//! ```text
//! Login Flow ──▶ Session State ──▶ Sync Engine ──▶ Message Dispatcher
//!                                                      │
//!                        Contact Directory ◀───────────┤
//!                                                      ▼
//!                                                  Event Bus ──▶ handlers
//! ```
//!
//! All network access goes through a [`RequestGateway`]; the default
//! [`ReqwestGateway`] keeps cookies across requests.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use wechat_web_client::prelude::*;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ClientConfig::from_env()?;
//! let gateway = Arc::new(ReqwestGateway::new(&config.user_agent)?);
//! let client = WechatClient::new(config, gateway);
//!
//! client.subscribe(Arc::new(|event: &Event| {
//!     if let Event::Text(message) = event {
//!         println!("{}: {}", message.from_name, message.raw_content);
//!     }
//! }));
//!
//! client.start().await?;
//! client.send_text("hello", "filehelper").await?;
//! client.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod gateway;
pub mod login;
pub mod session;
pub mod sync;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use client::WechatClient;
pub use config::{ClientConfig, EndpointMap};
pub use directory::ContactDirectory;
pub use error::{ClientError, ClientResult};
pub use events::{Event, EventHandler};
pub use gateway::{RequestGateway, ReqwestGateway};
pub use session::Phase;
pub use types::*;

/// Prelude for common imports
pub mod prelude {
    pub use crate::client::WechatClient;
    pub use crate::config::ClientConfig;
    pub use crate::error::{ClientError, ClientResult};
    pub use crate::events::{Event, EventHandler};
    pub use crate::gateway::{RequestGateway, ReqwestGateway};
    pub use crate::session::Phase;
    pub use crate::types::*;
}
