//! Sync engine
//!
//! One long-poll loop per session: `synccheck` tells whether anything is
//! pending, `webwxsync` fetches it. The next iteration is only scheduled
//! after the previous one (dispatch and media enrichment included) has
//! completed.

use regex::Regex;
use serde_json::json;
use std::sync::Arc;
use std::sync::LazyLock;
use tracing::{debug, error, info, warn};

use crate::client::{WechatClient, inverted_timestamp, now_millis};
use crate::error::{ClientError, ClientResult};
use crate::events::Event;
use crate::gateway::{Decode, GatewayRequest};
use crate::types::{SYNCCHECK_RET_SUCCESS, SYNCCHECK_SELECTOR_NORMAL, SyncResponse};

static SYNCCHECK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"window\.synccheck=\{retcode:"(\d+)",selector:"(\d+)"\}"#)
        .expect("valid synccheck pattern")
});

/// Parsed `synccheck` answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
    pub retcode: u32,
    pub selector: u32,
}

/// Result of one sync iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing pending
    Idle,
    /// A batch was fetched, this many messages were published
    Applied(usize),
    /// The client stopped while a request was in flight
    Discarded,
    /// The server reported the session as gone
    LoggedOut(u32),
}

pub(crate) fn parse_sync_check(body: &str) -> ClientResult<SyncStatus> {
    let caps = SYNCCHECK_RE
        .captures(body)
        .ok_or_else(|| ClientError::protocol("malformed synccheck response"))?;
    let retcode = caps[1]
        .parse()
        .map_err(|e| ClientError::protocol_with("invalid synccheck retcode", e))?;
    let selector = caps[2]
        .parse()
        .map_err(|e| ClientError::protocol_with("invalid synccheck selector", e))?;
    Ok(SyncStatus { retcode, selector })
}

impl WechatClient {
    /// Ask the push host whether new data is pending
    pub async fn check_for_updates(&self) -> ClientResult<SyncStatus> {
        self.ensure_running()?;
        let request = {
            let session = self.session.read();
            let endpoint = self.endpoints.read().sync_check.clone();
            GatewayRequest::get(endpoint)
                .query("r", now_millis())
                .query("sid", &session.sid)
                .query("uin", &session.uin)
                .query("skey", &session.skey)
                .query("deviceid", &session.device_id)
                .query("synckey", session.sync_cursor())
                .timeout(self.config.confirm_timeout())
        };

        let body = self
            .execute(request)
            .await
            .and_then(|response| response.into_text())
            .map_err(|e| ClientError::sync_with("synccheck request failed", e))?;
        parse_sync_check(&body)
    }

    /// Fetch pending messages, publish them and advance the cursor
    ///
    /// Returns [`ClientError::Stopped`] when the client stopped while the
    /// request or the dispatch was in flight; the rest of the batch is then
    /// dropped and the cursor kept.
    pub async fn fetch_updates(&self) -> ClientResult<usize> {
        self.ensure_running()?;
        let request = {
            let session = self.session.read();
            let endpoint = self.endpoints.read().sync.clone();
            GatewayRequest::post(endpoint)
                .query("sid", &session.sid)
                .query("skey", &session.skey)
                .query("lang", &self.config.lang)
                .query("pass_ticket", &session.pass_ticket)
                .json_body(json!({
                    "BaseRequest": &session.base_request,
                    "SyncKey": session.sync_key(),
                    "rr": inverted_timestamp(),
                }))
                .decode(Decode::Json)
        };

        let value = self
            .execute(request)
            .await
            .and_then(|response| response.into_json())
            .map_err(|e| ClientError::sync_with("sync request failed", e))?;
        let response: SyncResponse = serde_json::from_value(value)
            .map_err(|e| ClientError::sync_with("malformed sync response", e))?;
        if response.base_response.ret != 0 {
            return Err(ClientError::sync(format!(
                "sync rejected, Ret {}",
                response.base_response.ret
            )));
        }

        if self.is_stopped() {
            debug!(
                "Discarding sync batch of {} messages, client stopped",
                response.add_msg_list.len()
            );
            return Err(ClientError::Stopped);
        }

        let published = self.dispatch_batch(response.add_msg_list).await;
        if self.is_stopped() {
            debug!("Client stopped during dispatch, cursor not advanced");
            return Err(ClientError::Stopped);
        }

        if let Some(sync_key) = response.sync_key
            && !sync_key.list.is_empty()
        {
            self.session.write().update_sync_key(sync_key);
        }
        Ok(published)
    }

    /// Run one check/fetch iteration
    pub async fn sync_cycle(&self) -> ClientResult<CycleOutcome> {
        let status = match self.check_for_updates().await {
            Ok(status) => status,
            Err(ClientError::Stopped) => return Ok(CycleOutcome::Discarded),
            Err(err) => return Err(err),
        };
        if self.is_stopped() {
            return Ok(CycleOutcome::Discarded);
        }

        if status.retcode != SYNCCHECK_RET_SUCCESS {
            return Ok(CycleOutcome::LoggedOut(status.retcode));
        }
        if status.selector == SYNCCHECK_SELECTOR_NORMAL {
            return Ok(CycleOutcome::Idle);
        }

        debug!("synccheck selector {}, fetching", status.selector);
        match self.fetch_updates().await {
            Ok(published) => Ok(CycleOutcome::Applied(published)),
            Err(ClientError::Stopped) => Ok(CycleOutcome::Discarded),
            Err(err) => Err(err),
        }
    }

    /// Poll until stopped or until the session is torn down
    pub(crate) async fn run_sync_loop(self: Arc<Self>) {
        info!("Sync loop started");

        loop {
            match self.sync_cycle().await {
                Ok(CycleOutcome::Discarded) => break,
                Ok(CycleOutcome::LoggedOut(retcode)) => {
                    let err = ClientError::sync(format!(
                        "synccheck retcode {}, session logged out",
                        retcode
                    ));
                    self.escalate(err).await;
                    break;
                }
                Ok(CycleOutcome::Applied(published)) => {
                    self.session.write().reset_sync_errors();
                    debug!("Sync batch applied, {} messages published", published);
                }
                Ok(CycleOutcome::Idle) => {
                    self.session.write().reset_sync_errors();
                }
                Err(err) if self.is_stopped() => {
                    debug!("Sync cycle failed after stop, ignored: {}", err);
                    break;
                }
                Err(err) => {
                    let count = self.session.write().record_sync_error();
                    if count > self.config.max_sync_errors {
                        self.escalate(err).await;
                        break;
                    }
                    warn!(
                        "Sync cycle failed ({}/{}): {}",
                        count, self.config.max_sync_errors, err
                    );
                }
            }

            let notified = self.shutdown_notifier.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_stopped() {
                break;
            }
            tokio::select! {
                _ = &mut notified => break,
                _ = tokio::time::sleep(self.config.sync_interval()) => {}
            }
        }

        info!("Sync loop finished");
    }

    /// Report a fatal sync failure and tear the session down
    async fn escalate(&self, err: ClientError) {
        error!("Sync failed permanently: {}", err);
        self.events.dispatch(&Event::SessionError(err));
        if let Err(logout_err) = self.logout().await {
            warn!("Logout after sync failure: {}", logout_err);
        }
    }
}
