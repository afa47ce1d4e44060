//! QR login flow
//!
//! Handles:
//! - Ticket (uuid) acquisition and the QR-ready notification
//! - Confirmation long-poll and its status-code policy
//! - Session establishment from the redirect target
//! - Session initialization and the mobile status notification
//!
//! At most one confirmation waiter is pending at a time: every new ticket
//! rejects the previous waiter with [`ClientError::Reload`].

use regex::Regex;
use serde_json::json;
use std::sync::LazyLock;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::client::{WechatClient, inverted_timestamp, now_millis, parse_status};
use crate::error::{ClientError, ClientResult};
use crate::events::Event;
use crate::gateway::{Decode, GatewayRequest};
use crate::session::{BaseRequest, Phase};
use crate::types::{InitResponse, LoginCredentials};

static TICKET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"window\.QRLogin\.code = (\d+); window\.QRLogin\.uuid = "(\S+?)""#)
        .expect("valid ticket pattern")
});
static CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"window\.code=(\d+);").expect("valid code pattern"));
static REDIRECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"window\.redirect_uri="(\S+?)";"#).expect("valid redirect pattern")
});

/// Cookie carrying the media upload ticket
const DATA_TICKET_COOKIE: &str = "webwx_data_ticket";

// =============================================================================
// Login State
// =============================================================================

/// Handshake stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoginStage {
    #[default]
    Init,
    UuidObtained,
    AwaitingScan,
    Confirmed,
    SessionEstablished,
}

type WaiterResult = ClientResult<()>;

#[derive(Debug, Default)]
pub(crate) struct LoginFlowState {
    pub stage: LoginStage,
    waiter_tx: Option<oneshot::Sender<WaiterResult>>,
    waiter_rx: Option<oneshot::Receiver<WaiterResult>>,
}

impl LoginFlowState {
    /// Install a fresh waiter, returning the sender it replaces
    fn arm(&mut self) -> Option<oneshot::Sender<WaiterResult>> {
        let (tx, rx) = oneshot::channel();
        self.waiter_rx = Some(rx);
        self.waiter_tx.replace(tx)
    }

    pub fn take_waiter(&mut self) -> Option<oneshot::Sender<WaiterResult>> {
        self.waiter_tx.take()
    }

    pub fn has_pending_waiter(&self) -> bool {
        self.waiter_tx.is_some()
    }
}

/// Resolves once the current ticket is confirmed on the phone
#[derive(Debug)]
pub struct ConfirmationWaiter {
    rx: oneshot::Receiver<WaiterResult>,
}

impl ConfirmationWaiter {
    pub async fn wait(self) -> ClientResult<()> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::login("confirmation waiter dropped")),
        }
    }
}

/// Result of one confirmation poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    /// Code 200: the waiter was resolved
    Confirmed,
    /// Code 201 or 408: poll again immediately
    Pending(u32),
    /// Any other code: the ticket was replaced by the contained uuid
    Reloaded(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConfirmationStatus {
    pub code: u32,
    pub redirect: Option<String>,
}

// =============================================================================
// Parsing
// =============================================================================

/// Extract the ticket uuid, requiring status code 200
pub(crate) fn parse_ticket(body: &str) -> ClientResult<String> {
    let caps = TICKET_RE
        .captures(body)
        .ok_or_else(|| ClientError::protocol("malformed ticket response"))?;
    let code: u32 = caps[1]
        .parse()
        .map_err(|e| ClientError::protocol_with("invalid ticket status code", e))?;
    if code != 200 {
        return Err(ClientError::protocol(format!("ticket request returned code {}", code)));
    }
    Ok(caps[2].to_string())
}

/// A missing code reads as 0 (ticket invalid)
pub(crate) fn parse_confirmation(body: &str) -> ConfirmationStatus {
    let code = CODE_RE
        .captures(body)
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(0);
    let redirect = REDIRECT_RE
        .captures(body)
        .map(|caps| caps[1].to_string());
    ConfirmationStatus { code, redirect }
}

/// Value of the data ticket cookie from `set-cookie` headers
pub(crate) fn extract_data_ticket(set_cookie: &[String]) -> Option<String> {
    set_cookie
        .iter()
        .filter(|cookie| cookie.contains(DATA_TICKET_COOKIE))
        .filter_map(|cookie| cookie.split("; ").next())
        .filter_map(|pair| pair.split_once('='))
        .map(|(_, value)| value.to_string())
        .last()
}

fn required(field: Option<String>, name: &str) -> ClientResult<String> {
    match field {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ClientError::login(format!("login response missing {}", name))),
    }
}

// =============================================================================
// Login Flow
// =============================================================================

impl WechatClient {
    /// Request a fresh QR ticket
    ///
    /// Rejects any pending confirmation waiter with `Reload` and emits
    /// `TicketReady`.
    pub async fn obtain_ticket(&self) -> ClientResult<String> {
        self.ensure_running()?;
        let endpoint = self.endpoints.read().ticket.clone();
        let request = GatewayRequest::post(endpoint)
            .query("appid", &self.config.app_id)
            .query("fun", "new")
            .query("lang", &self.config.lang);

        let result = match self.execute(request).await {
            Ok(response) => response.into_text().and_then(|body| parse_ticket(&body)),
            Err(err) => Err(ClientError::login_with("ticket request failed", err)),
        };
        let uuid = match result {
            Ok(uuid) => uuid,
            Err(err) => {
                self.login.lock().stage = LoginStage::Init;
                warn!("Failed to obtain login ticket: {}", err);
                return Err(err);
            }
        };

        {
            let mut session = self.session.write();
            session.uuid = uuid.clone();
            session.phase = Phase::AwaitingScan;
        }
        let previous = {
            let mut login = self.login.lock();
            login.stage = LoginStage::UuidObtained;
            login.arm()
        };
        if let Some(previous) = previous {
            debug!("Rejecting previous confirmation waiter");
            let _ = previous.send(Err(ClientError::Reload));
        }

        info!("Login ticket ready: {}", uuid);
        self.events.dispatch(&Event::TicketReady(uuid.clone()));
        Ok(uuid)
    }

    /// Take the waiter for the current ticket, if nobody took it yet
    pub fn confirmation_waiter(&self) -> Option<ConfirmationWaiter> {
        self.login
            .lock()
            .waiter_rx
            .take()
            .map(|rx| ConfirmationWaiter { rx })
    }

    pub fn login_stage(&self) -> LoginStage {
        self.login.lock().stage
    }

    /// Issue one confirmation poll and apply the status-code policy
    ///
    /// `tip` is 1 on the first poll of a ticket (the phone shows a prompt).
    pub async fn poll_confirmation(&self, tip: u8) -> ClientResult<ConfirmationOutcome> {
        self.ensure_running()?;
        let uuid = self.session.read().uuid.clone();
        if uuid.is_empty() {
            return Err(ClientError::login("no login ticket to poll"));
        }
        {
            let mut login = self.login.lock();
            if login.stage == LoginStage::UuidObtained {
                login.stage = LoginStage::AwaitingScan;
            }
        }

        let endpoint = self.endpoints.read().confirm.clone();
        let request = GatewayRequest::get(endpoint)
            .query("tip", if tip == 1 { 1 } else { 0 })
            .query("uuid", &uuid)
            .query("r", inverted_timestamp());

        let status = match tokio::time::timeout(self.config.confirm_timeout(), self.execute(request))
            .await
        {
            Ok(Ok(response)) => {
                let body = response
                    .into_text()
                    .map_err(|e| ClientError::login_with("unreadable confirmation response", e))?;
                parse_confirmation(&body)
            }
            Ok(Err(err)) => {
                return Err(ClientError::login_with("confirmation poll failed", err));
            }
            Err(_) => {
                debug!("Confirmation poll timed out");
                ConfirmationStatus {
                    code: 408,
                    redirect: None,
                }
            }
        };
        self.ensure_running()?;
        debug!("Confirmation poll code {}", status.code);

        self.apply_confirmation(status).await
    }

    async fn apply_confirmation(&self, status: ConfirmationStatus) -> ClientResult<ConfirmationOutcome> {
        match status.code {
            200 => {
                let redirect = status
                    .redirect
                    .ok_or_else(|| ClientError::protocol("confirmation without redirect target"))?;
                self.endpoints.write().apply_redirect(&redirect);

                let waiter = {
                    let mut login = self.login.lock();
                    login.stage = LoginStage::Confirmed;
                    login.take_waiter()
                };
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(()));
                }

                info!("Login confirmed on phone");
                self.events.dispatch(&Event::Authenticated);
                Ok(ConfirmationOutcome::Confirmed)
            }
            201 | 408 => Ok(ConfirmationOutcome::Pending(status.code)),
            code => {
                warn!("Login ticket invalid (code {}), reloading", code);
                let waiter = self.login.lock().take_waiter();
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(ClientError::Reload));
                }
                let uuid = self.obtain_ticket().await?;
                Ok(ConfirmationOutcome::Reloaded(uuid))
            }
        }
    }

    /// Poll until the scan is confirmed, following ticket reloads
    pub async fn wait_for_confirmation(&self) -> ClientResult<()> {
        let mut waiter = self
            .confirmation_waiter()
            .ok_or_else(|| ClientError::login("no pending login ticket"))?;
        let mut tip = 1;
        let mut reloads = 0;

        loop {
            match self.poll_confirmation(tip).await? {
                ConfirmationOutcome::Confirmed => break,
                ConfirmationOutcome::Pending(code) => {
                    if code == 201 {
                        debug!("QR code scanned, waiting for confirmation");
                    }
                    tip = 0;
                }
                ConfirmationOutcome::Reloaded(uuid) => {
                    reloads += 1;
                    if reloads > self.config.max_ticket_reloads {
                        return Err(ClientError::login(format!(
                            "login ticket reloaded {} times without confirmation",
                            reloads
                        )));
                    }
                    debug!("Following reloaded ticket {}", uuid);
                    waiter = self
                        .confirmation_waiter()
                        .ok_or_else(|| ClientError::login("reloaded ticket has no waiter"))?;
                    tip = 1;
                }
            }
        }

        waiter.wait().await
    }

    /// Follow the redirect target and store the session credentials
    pub async fn establish_session(&self) -> ClientResult<()> {
        self.ensure_running()?;
        let redirect = self.endpoints.read().redirect.clone();
        if redirect.is_empty() {
            return Err(ClientError::login("no redirect target, login not confirmed"));
        }

        let request = GatewayRequest::get(format!("{}&fun=new&version=v2", redirect));
        let response = self
            .execute(request)
            .await
            .map_err(|e| ClientError::login_with("session request failed", e))?;

        let data_ticket = extract_data_ticket(response.header_values("set-cookie"));
        let body = response
            .into_text()
            .map_err(|e| ClientError::login_with("unreadable session response", e))?;
        let credentials: LoginCredentials = serde_xml_rs::from_str(&body)
            .map_err(|e| ClientError::login_with("malformed session response", e))?;

        let skey = required(credentials.skey, "skey")?;
        let sid = required(credentials.wxsid, "wxsid")?;
        let uin = required(credentials.wxuin, "wxuin")?;
        let pass_ticket = required(credentials.pass_ticket, "pass_ticket")?;
        let uin_value: i64 = uin
            .parse()
            .map_err(|e| ClientError::login_with("invalid wxuin", e))?;

        {
            let mut session = self.session.write();
            session.base_request = BaseRequest {
                uin: uin_value,
                sid: sid.clone(),
                skey: skey.clone(),
                device_id: session.device_id.clone(),
            };
            session.skey = skey;
            session.sid = sid;
            session.uin = uin;
            session.pass_ticket = pass_ticket;
            if let Some(ticket) = data_ticket {
                session.data_ticket = ticket;
            }
        }
        self.login.lock().stage = LoginStage::SessionEstablished;

        info!("Session established");
        Ok(())
    }

    /// Post the base request, store the own identity and seed the cursor
    pub async fn initialize_session(&self) -> ClientResult<()> {
        self.ensure_running()?;
        let (base_request, pass_ticket) = {
            let session = self.session.read();
            (session.base_request.clone(), session.pass_ticket.clone())
        };
        let endpoint = self.endpoints.read().init.clone();
        let request = GatewayRequest::post(endpoint)
            .query("r", now_millis())
            .query("pass_ticket", pass_ticket)
            .json_body(json!({ "BaseRequest": base_request }))
            .decode(Decode::Json);

        let value = self
            .execute(request)
            .await
            .and_then(|response| response.into_json())
            .map_err(|e| ClientError::login_with("session init request failed", e))?;
        let init: InitResponse = serde_json::from_value(value)
            .map_err(|e| ClientError::login_with("malformed session init response", e))?;

        if init.base_response.ret != 0 {
            return Err(ClientError::login(format!(
                "session init rejected, Ret {}",
                init.base_response.ret
            )));
        }
        let user = init
            .user
            .ok_or_else(|| ClientError::login("session init response missing User"))?;
        let sync_key = init
            .sync_key
            .ok_or_else(|| ClientError::login("session init response missing SyncKey"))?;

        info!("Session initialized for {}", user.user_name);
        {
            let mut session = self.session.write();
            session.update_sync_key(sync_key);
            session.phase = Phase::Authenticated;
        }
        self.directory.write().refresh_own_identity(user);
        Ok(())
    }

    /// Tell the phone that the web session is open
    pub async fn notify_mobile(&self) -> ClientResult<()> {
        self.ensure_running()?;
        let own_id = self
            .directory
            .read()
            .own_id()
            .map(str::to_string)
            .ok_or_else(|| ClientError::login("own identity unknown"))?;
        let base_request = self.session.read().base_request.clone();
        let endpoint = self.endpoints.read().status_notify.clone();

        let request = GatewayRequest::post(endpoint)
            .json_body(json!({
                "BaseRequest": base_request,
                "Code": 3,
                "FromUserName": own_id,
                "ToUserName": own_id,
                "ClientMsgId": now_millis(),
            }))
            .decode(Decode::Json);

        let status = self
            .execute(request)
            .await
            .and_then(parse_status)
            .map_err(|e| ClientError::login_with("status notify failed", e))?;
        if status.ret != 0 {
            return Err(ClientError::login(format!(
                "status notify rejected, Ret {}",
                status.ret
            )));
        }
        debug!("Status notification enabled");
        Ok(())
    }
}
