//! WeChat Web client
//!
//! Owns the session state, the contact directory and the event bus, and
//! exposes the operator commands `start`, `stop` and `send_text`. The login
//! flow, sync engine and dispatcher live in their own modules as further
//! `impl WechatClient` blocks.

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, EndpointMap};
use crate::directory::ContactDirectory;
use crate::error::{ClientError, ClientResult};
use crate::events::{Event, EventBus, EventHandler};
use crate::gateway::{Decode, GatewayRequest, GatewayResponse, RequestGateway};
use crate::login::LoginFlowState;
use crate::session::{Phase, SessionState};
use crate::types::{BaseResponse, Friend, Member, StatusResponse, msg_type};

pub struct WechatClient {
    pub(crate) config: ClientConfig,
    gateway: Arc<dyn RequestGateway>,
    pub(crate) session: RwLock<SessionState>,
    pub(crate) endpoints: RwLock<EndpointMap>,
    pub(crate) directory: RwLock<ContactDirectory>,
    pub(crate) login: Mutex<LoginFlowState>,
    pub(crate) events: EventBus,
    stopped: AtomicBool,
    pub(crate) shutdown_notifier: Notify,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl WechatClient {
    pub fn new(config: ClientConfig, gateway: Arc<dyn RequestGateway>) -> Arc<Self> {
        let endpoints = EndpointMap::for_login_host(&config.login_host);
        Arc::new(Self {
            config,
            gateway,
            session: RwLock::new(SessionState::new()),
            endpoints: RwLock::new(endpoints),
            directory: RwLock::new(ContactDirectory::default()),
            login: Mutex::new(LoginFlowState::default()),
            events: EventBus::new(),
            stopped: AtomicBool::new(false),
            shutdown_notifier: Notify::new(),
            sync_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Register an event handler; handlers run in registration order
    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        self.events.subscribe(handler);
    }

    pub fn phase(&self) -> Phase {
        self.session.read().phase
    }

    pub fn uuid(&self) -> String {
        self.session.read().uuid.clone()
    }

    /// Formatted sync cursor sent with every poll
    pub fn sync_cursor(&self) -> String {
        self.session.read().sync_cursor().to_string()
    }

    pub fn own_user(&self) -> Option<Member> {
        self.directory.read().own_user().cloned()
    }

    pub fn endpoints(&self) -> EndpointMap {
        self.endpoints.read().clone()
    }

    /// Snapshot of the contact directory
    pub fn directory(&self) -> ContactDirectory {
        self.directory.read().clone()
    }

    pub fn friend_list(&self) -> Vec<Friend> {
        let origin = self.endpoints.read().head_image_origin.clone();
        self.directory.read().friend_list(&origin)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Flag the client stopped and wake the sync loop out of its sleep
    pub(crate) fn halt(&self) -> bool {
        let already_stopped = self.stopped.swap(true, Ordering::SeqCst);
        self.shutdown_notifier.notify_waiters();
        already_stopped
    }

    pub(crate) fn ensure_running(&self) -> ClientResult<()> {
        if self.is_stopped() {
            Err(ClientError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Execute a request through the gateway, rejecting HTTP error statuses
    pub(crate) async fn execute(&self, request: GatewayRequest) -> ClientResult<GatewayResponse> {
        let url = request.url.clone();
        let response = self.gateway.execute(request).await?;
        if response.status >= 400 {
            return Err(ClientError::transport(format!(
                "HTTP {} from {}",
                response.status, url
            )));
        }
        Ok(response)
    }

    /// Run the full startup sequence: login, directory, sync engine
    ///
    /// On failure the session is torn down before the summary error is
    /// returned.
    pub async fn start(self: &Arc<Self>) -> ClientResult<()> {
        if self.phase() == Phase::Terminated {
            self.reset();
        }
        self.stopped.store(false, Ordering::SeqCst);

        match self.run_startup().await {
            Ok(()) => {
                info!("WeChat client started, sync engine running");
                Ok(())
            }
            Err(err) => {
                error!("Startup failed: {}", err);
                if let Err(stop_err) = self.stop().await {
                    warn!("Teardown after failed startup: {}", stop_err);
                }
                Err(ClientError::Startup(Box::new(err)))
            }
        }
    }

    async fn run_startup(self: &Arc<Self>) -> ClientResult<()> {
        // Reuse a ticket obtained earlier that is still waiting for a scan
        let has_pending_ticket =
            self.phase() == Phase::AwaitingScan && self.login.lock().has_pending_waiter();
        if !has_pending_ticket {
            self.obtain_ticket().await?;
        }

        self.wait_for_confirmation().await?;
        self.establish_session().await?;
        self.initialize_session().await?;
        self.notify_mobile().await?;
        self.refresh_member_list().await?;
        self.refresh_group_members().await?;

        if self.phase() != Phase::Active {
            return Err(ClientError::login(
                "session did not become active, sync engine not started",
            ));
        }
        self.ensure_running()?;

        self.start_sync();
        Ok(())
    }

    /// Fresh state for a client restarted after termination
    fn reset(&self) {
        *self.session.write() = SessionState::new();
        *self.directory.write() = ContactDirectory::default();
        *self.endpoints.write() = EndpointMap::for_login_host(&self.config.login_host);
        *self.login.lock() = LoginFlowState::default();
    }

    /// Spawn the sync loop; at most one loop runs at a time
    pub(crate) fn start_sync(self: &Arc<Self>) {
        let mut guard = self.sync_task.lock();
        if let Some(handle) = guard.as_ref()
            && !handle.is_finished()
        {
            debug!("Sync loop already running");
            return;
        }
        let client = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            client.run_sync_loop().await;
        }));
    }

    /// Stop the client; logs out when a session is established
    ///
    /// Idempotent. No further poll is scheduled once this returns; requests
    /// already in flight complete but their results are discarded.
    pub async fn stop(&self) -> ClientResult<()> {
        let already_stopped = self.halt();

        let waiter = self.login.lock().take_waiter();
        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(ClientError::Stopped));
        }

        if !already_stopped {
            info!("Stopping WeChat client");
        }

        let logged_in = self.session.read().is_logged_in();
        if logged_in {
            self.logout().await
        } else {
            Ok(())
        }
    }

    /// Log out and mark the session terminated
    ///
    /// `SessionEnded` is emitted even when the logout request fails, since
    /// the server may still have dropped the session.
    pub(crate) async fn logout(&self) -> ClientResult<()> {
        let skey = {
            let mut session = self.session.write();
            if session.phase == Phase::Terminated {
                return Ok(());
            }
            session.phase = Phase::Terminated;
            session.skey.clone()
        };
        self.halt();

        let endpoint = self.endpoints.read().logout.clone();
        let request = GatewayRequest::post(endpoint)
            .query("redirect", 1)
            .query("type", 0)
            .query("skey", skey);

        let result = self.execute(request).await;
        self.events.dispatch(&Event::SessionEnded);

        match result {
            Ok(_) => {
                info!("Logged out");
                Ok(())
            }
            Err(err) => {
                warn!("Logout request failed: {}", err);
                Err(ClientError::login_with("logout may not have completed", err))
            }
        }
    }

    /// Send a text message, returning the client message id
    pub async fn send_text(&self, content: &str, to: &str) -> ClientResult<String> {
        let (base_request, pass_ticket) = {
            let session = self.session.read();
            if !session.is_logged_in() {
                return Err(ClientError::send("session is not logged in"));
            }
            (session.base_request.clone(), session.pass_ticket.clone())
        };
        let from = self
            .directory
            .read()
            .own_id()
            .map(str::to_string)
            .unwrap_or_default();
        let client_msg_id = generate_client_msg_id();

        let body = json!({
            "BaseRequest": base_request,
            "Msg": {
                "Type": msg_type::TEXT,
                "Content": content,
                "FromUserName": from,
                "ToUserName": to,
                "LocalID": client_msg_id,
                "ClientMsgId": client_msg_id,
            }
        });

        let endpoint = self.endpoints.read().send_msg.clone();
        let request = GatewayRequest::post(endpoint)
            .query("lang", &self.config.lang)
            .query("pass_ticket", pass_ticket)
            .json_body(body)
            .decode(Decode::Json);

        let response = self
            .execute(request)
            .await
            .map_err(|e| ClientError::send_with("send message request failed", e))?;
        let status = parse_status(response)?;
        if status.ret != 0 {
            return Err(ClientError::send(format!(
                "send message rejected, Ret {}",
                status.ret
            )));
        }

        debug!("Sent text message {} to {}", client_msg_id, to);
        Ok(client_msg_id)
    }
}

/// Decode a `{BaseResponse: {...}}` body
pub(crate) fn parse_status(response: GatewayResponse) -> ClientResult<BaseResponse> {
    let value = response.into_json()?;
    let status: StatusResponse = serde_json::from_value(value)
        .map_err(|e| ClientError::protocol_with("missing BaseResponse", e))?;
    Ok(status.base_response)
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Bitwise-not of the millisecond clock truncated to 32 bits
pub(crate) fn inverted_timestamp() -> i32 {
    !(now_millis() as i32)
}

/// Millisecond timestamp, a `0` and three random digits
fn generate_client_msg_id() -> String {
    let suffix: u16 = rand::rng().random_range(0..1000);
    format!("{}0{:03}", now_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        RecordingHandler, ScriptedGateway, active_client, push_login_sequence, sync_check_body,
        test_client, test_config,
    };
    use serde_json::json;

    #[test]
    fn test_client_msg_id_shape() {
        let id = generate_client_msg_id();
        assert_eq!(id.len(), 13 + 1 + 3);
        assert!(id.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_send_text_request_body() {
        let gateway = ScriptedGateway::new();
        gateway.push_json("webwxsendmsg", json!({"BaseResponse": {"Ret": 0}}));
        let client = active_client(gateway.clone());

        let client_msg_id = client.send_text("hi", "friend1").await.unwrap();

        let requests = gateway.requests_to("webwxsendmsg");
        assert_eq!(requests.len(), 1);
        let body = requests[0].body.as_ref().unwrap();
        assert_eq!(body["Msg"]["Type"], msg_type::TEXT);
        assert_eq!(body["Msg"]["ToUserName"], "friend1");
        assert_eq!(body["Msg"]["Content"], "hi");
        assert_eq!(body["Msg"]["FromUserName"], "@self");
        assert_eq!(body["Msg"]["ClientMsgId"], client_msg_id.as_str());
        assert_eq!(body["Msg"]["LocalID"], client_msg_id.as_str());
        assert_eq!(body["BaseRequest"]["Sid"], "sid-1");
    }

    #[tokio::test]
    async fn test_send_text_nonzero_ret() {
        let gateway = ScriptedGateway::new();
        gateway.push_json("webwxsendmsg", json!({"BaseResponse": {"Ret": 1101}}));
        let client = active_client(gateway.clone());

        let err = client.send_text("hi", "friend1").await.unwrap_err();
        assert_eq!(err.kind(), "send");
    }

    #[tokio::test]
    async fn test_send_text_requires_login() {
        let gateway = ScriptedGateway::new();
        let client = test_client(gateway.clone());

        let err = client.send_text("hi", "friend1").await.unwrap_err();
        assert_eq!(err.kind(), "send");
        assert!(gateway.requests().is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_noop_when_not_logged_in() {
        let gateway = ScriptedGateway::new();
        let client = test_client(gateway.clone());
        let recorder = RecordingHandler::attach(&client);

        client.stop().await.unwrap();
        client.stop().await.unwrap();

        assert!(client.is_stopped());
        assert!(gateway.requests().is_empty());
        assert_eq!(recorder.count("session_ended"), 0);
    }

    #[tokio::test]
    async fn test_stop_logs_out_once() {
        let gateway = ScriptedGateway::new();
        gateway.push_text("webwxlogout", "");
        let client = active_client(gateway.clone());
        let recorder = RecordingHandler::attach(&client);

        client.stop().await.unwrap();
        client.stop().await.unwrap();

        assert_eq!(client.phase(), Phase::Terminated);
        assert_eq!(gateway.requests_to("webwxlogout").len(), 1);
        assert_eq!(recorder.count("session_ended"), 1);
    }

    #[tokio::test]
    async fn test_logout_failure_still_ends_session() {
        let gateway = ScriptedGateway::new();
        let client = active_client(gateway.clone());
        let recorder = RecordingHandler::attach(&client);

        let err = client.stop().await.unwrap_err();
        assert_eq!(err.kind(), "login");
        assert_eq!(client.phase(), Phase::Terminated);
        assert_eq!(recorder.count("session_ended"), 1);
    }

    #[tokio::test]
    async fn test_start_reuses_ticket_and_runs_sync() {
        let gateway = ScriptedGateway::new();
        push_login_sequence(&gateway);
        gateway.push_json(
            "webwxgetcontact",
            json!({"BaseResponse": {"Ret": 0}, "MemberList": [
                {"UserName": "@friend", "NickName": "Friend"},
                {"UserName": "@@room", "NickName": "Room"},
            ]}),
        );
        gateway.push_json(
            "webwxbatchgetcontact",
            json!({"BaseResponse": {"Ret": 0}, "ContactList": [
                {"UserName": "@@room", "MemberList": [{"UserName": "@friend"}]},
            ]}),
        );
        gateway.push_text("synccheck", sync_check_body(0, 0));
        gateway.push_text("webwxlogout", "");
        let config = ClientConfig {
            sync_interval_ms: 60_000,
            ..test_config()
        };
        let client = WechatClient::new(config, gateway.clone());
        let recorder = RecordingHandler::attach(&client);

        client.obtain_ticket().await.unwrap();
        client.start().await.unwrap();

        assert_eq!(client.phase(), Phase::Active);
        assert_eq!(gateway.requests_to("jslogin").len(), 1);
        assert_eq!(recorder.tickets(), vec!["abc123"]);
        assert_eq!(recorder.count("authenticated"), 1);
        assert_eq!(recorder.count("directory_ready"), 1);
        assert_eq!(client.sync_cursor(), "1_11");

        for _ in 0..100 {
            if !gateway.requests_to("synccheck").is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(gateway.requests_to("synccheck").len(), 1);

        client.stop().await.unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(gateway.requests_to("synccheck").len(), 1);
        assert_eq!(gateway.requests_to("webwxlogout").len(), 1);
        assert_eq!(client.phase(), Phase::Terminated);
    }

    #[tokio::test]
    async fn test_start_with_empty_contacts_tears_down() {
        let gateway = ScriptedGateway::new();
        push_login_sequence(&gateway);
        gateway.push_json(
            "webwxgetcontact",
            json!({"BaseResponse": {"Ret": 0}, "MemberCount": 0, "MemberList": []}),
        );
        gateway.push_text("webwxlogout", "");
        let client = test_client(gateway.clone());
        let recorder = RecordingHandler::attach(&client);

        let err = client.start().await.unwrap_err();

        assert!(matches!(err, ClientError::Startup(ref inner) if inner.kind() == "directory"));
        assert_eq!(gateway.requests_to("webwxlogout").len(), 1);
        assert!(gateway.requests_to("synccheck").is_empty());
        assert_eq!(client.phase(), Phase::Terminated);
        assert_eq!(recorder.count("session_ended"), 1);
    }
}
