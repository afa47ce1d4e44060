//! Test helpers: a scripted request gateway, an event recorder and
//! prebuilt clients.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::client::WechatClient;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::events::{Event, EventHandler};
use crate::gateway::{Body, GatewayRequest, GatewayResponse, RequestGateway};
use crate::session::{BaseRequest, Phase};
use crate::types::{Member, SyncKey, SyncKeyPair, SyncValue};

pub const TEST_REDIRECT: &str = "https://wx.test/cgi-bin/mmwebwx-bin/webwxnewloginpage?ticket=T&uuid=abc123&lang=zh_CN&scan=1";

pub fn ticket_body(code: u32, uuid: &str) -> String {
    format!(
        "window.QRLogin.code = {}; window.QRLogin.uuid = \"{}\";",
        code, uuid
    )
}

pub fn confirm_body(code: u32, redirect: Option<&str>) -> String {
    match redirect {
        Some(redirect) => format!("window.code={};\nwindow.redirect_uri=\"{}\";", code, redirect),
        None => format!("window.code={};", code),
    }
}

pub fn sync_check_body(retcode: u32, selector: u32) -> String {
    format!(
        "window.synccheck={{retcode:\"{}\",selector:\"{}\"}}",
        retcode, selector
    )
}

pub fn text_response(body: impl Into<String>) -> GatewayResponse {
    GatewayResponse {
        status: 200,
        headers: HashMap::new(),
        body: Body::Text(body.into()),
    }
}

pub fn json_response(body: serde_json::Value) -> GatewayResponse {
    GatewayResponse {
        status: 200,
        headers: HashMap::new(),
        body: Body::Json(body),
    }
}

pub fn numeric_sync_key(pairs: &[(i64, i64)]) -> SyncKey {
    SyncKey {
        count: pairs.len(),
        list: pairs
            .iter()
            .map(|&(key, val)| SyncKeyPair {
                key: SyncValue::Number(key),
                val: SyncValue::Number(val),
            })
            .collect(),
    }
}

pub fn member(id: &str, nick: &str) -> Member {
    Member {
        user_name: id.to_string(),
        nick_name: nick.to_string(),
        ..Default::default()
    }
}

// =============================================================================
// Scripted Gateway
// =============================================================================

type Scripted = ClientResult<GatewayResponse>;
type Hook = Arc<dyn Fn() + Send + Sync>;

/// Replays queued responses by URL fragment and records every request
///
/// A request matches the first route whose fragment occurs in its URL and
/// still has a queued response. Unmatched requests fail with a transport
/// error, like an unreachable host.
#[derive(Default)]
pub struct ScriptedGateway {
    routes: Mutex<Vec<(String, VecDeque<Scripted>)>>,
    hooks: Mutex<Vec<(String, Hook)>>,
    requests: Mutex<Vec<GatewayRequest>>,
}

impl ScriptedGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, fragment: &str, response: Scripted) {
        let mut routes = self.routes.lock();
        match routes.iter_mut().find(|(f, _)| f == fragment) {
            Some((_, queue)) => queue.push_back(response),
            None => routes.push((fragment.to_string(), VecDeque::from([response]))),
        }
    }

    pub fn push_response(&self, fragment: &str, response: GatewayResponse) {
        self.push(fragment, Ok(response));
    }

    pub fn push_text(&self, fragment: &str, body: impl Into<String>) {
        self.push_response(fragment, text_response(body));
    }

    pub fn push_json(&self, fragment: &str, body: serde_json::Value) {
        self.push_response(fragment, json_response(body));
    }

    pub fn push_binary(&self, fragment: &str, data: Vec<u8>, content_type: &str) {
        let response = GatewayResponse {
            status: 200,
            headers: HashMap::new(),
            body: Body::Binary(Bytes::from(data)),
        }
        .with_header("content-type", content_type);
        self.push_response(fragment, response);
    }

    pub fn push_error(&self, fragment: &str, message: &str) {
        self.push(fragment, Err(ClientError::transport(message)));
    }

    /// Run `hook` whenever a request to `fragment` is executed
    pub fn on_request(&self, fragment: &str, hook: impl Fn() + Send + Sync + 'static) {
        let hook: Hook = Arc::new(hook);
        self.hooks.lock().push((fragment.to_string(), hook));
    }

    pub fn requests(&self) -> Vec<GatewayRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_to(&self, fragment: &str) -> Vec<GatewayRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.url.contains(fragment))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RequestGateway for ScriptedGateway {
    async fn execute(&self, request: GatewayRequest) -> ClientResult<GatewayResponse> {
        let url = request.url.clone();
        self.requests.lock().push(request);

        let hooks: Vec<Hook> = self
            .hooks
            .lock()
            .iter()
            .filter(|(fragment, _)| url.contains(fragment.as_str()))
            .map(|(_, hook)| hook.clone())
            .collect();
        for hook in hooks {
            hook();
        }

        let scripted = self
            .routes
            .lock()
            .iter_mut()
            .find(|(fragment, queue)| url.contains(fragment.as_str()) && !queue.is_empty())
            .and_then(|(_, queue)| queue.pop_front());
        scripted.unwrap_or_else(|| Err(ClientError::transport(format!("no route to {}", url))))
    }
}

// =============================================================================
// Event Recorder
// =============================================================================

/// Summary of a published message, as seen by a subscriber
#[derive(Debug, Clone)]
pub struct RecordedMessage {
    pub event: &'static str,
    pub from_name: String,
    pub media_len: Option<usize>,
    pub media_content_type: Option<String>,
    pub media_url: Option<String>,
    pub media_error: Option<&'static str>,
}

#[derive(Default)]
pub struct RecordingHandler {
    names: Mutex<Vec<&'static str>>,
    tickets: Mutex<Vec<String>>,
    messages: Mutex<Vec<RecordedMessage>>,
}

impl RecordingHandler {
    pub fn attach(client: &WechatClient) -> Arc<Self> {
        let handler = Arc::new(Self::default());
        client.subscribe(handler.clone());
        handler
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.names.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names.lock().iter().filter(|n| **n == name).count()
    }

    pub fn tickets(&self) -> Vec<String> {
        self.tickets.lock().clone()
    }

    pub fn messages(&self) -> Vec<RecordedMessage> {
        self.messages.lock().clone()
    }
}

impl EventHandler for RecordingHandler {
    fn handle_event(&self, event: &Event) {
        self.names.lock().push(event.name());

        let message = match event {
            Event::TicketReady(uuid) => {
                self.tickets.lock().push(uuid.clone());
                return;
            }
            Event::Text(m)
            | Event::Image(m)
            | Event::Voice(m)
            | Event::Sticker(m)
            | Event::StatusNotify(m)
            | Event::VerifyRequest(m) => m,
            _ => return,
        };

        self.messages.lock().push(RecordedMessage {
            event: event.name(),
            from_name: message.from_name.clone(),
            media_len: message.media_payload().map(|p| p.data.len()),
            media_content_type: message
                .media_payload()
                .and_then(|p| p.content_type.clone()),
            media_url: message.media_payload().and_then(|p| p.url.clone()),
            media_error: message.media_error().map(ClientError::kind),
        });
    }
}

// =============================================================================
// Clients
// =============================================================================

pub fn test_config() -> ClientConfig {
    ClientConfig {
        login_host: "https://login.test".to_string(),
        sync_interval_ms: 0,
        ..Default::default()
    }
}

pub fn test_client(gateway: Arc<ScriptedGateway>) -> Arc<WechatClient> {
    WechatClient::new(test_config(), gateway)
}

/// Queue every response `start()` needs up to the first sync check
///
/// The contact list is left out so callers can script a good or a bad one.
pub fn push_login_sequence(gateway: &ScriptedGateway) {
    gateway.push_text("jslogin", ticket_body(200, "abc123"));
    gateway.push_text("mmwebwx-bin/login", confirm_body(200, Some(TEST_REDIRECT)));
    gateway.push_text(
        "webwxnewloginpage",
        "<error><ret>0</ret><message></message><skey>@crypt_k</skey>\
         <wxsid>sid-9</wxsid><wxuin>4242</wxuin><pass_ticket>pt</pass_ticket></error>",
    );
    gateway.push_json(
        "webwxinit",
        serde_json::json!({
            "BaseResponse": {"Ret": 0},
            "User": {"UserName": "@self", "NickName": "Me"},
            "SyncKey": {"Count": 1, "List": [{"Key": 1, "Val": 11}]}
        }),
    );
    gateway.push_json(
        "webwxstatusnotify",
        serde_json::json!({"BaseResponse": {"Ret": 0}}),
    );
}

/// Client with an established, active session on `wx.test`
pub fn active_client(gateway: Arc<ScriptedGateway>) -> Arc<WechatClient> {
    active_client_with(test_config(), gateway)
}

pub fn active_client_with(config: ClientConfig, gateway: Arc<ScriptedGateway>) -> Arc<WechatClient> {
    let client = WechatClient::new(config, gateway);
    client.endpoints.write().apply_redirect(TEST_REDIRECT);

    {
        let mut session = client.session.write();
        session.uuid = "abc123".to_string();
        session.uin = "1001".to_string();
        session.sid = "sid-1".to_string();
        session.skey = "@crypt_test".to_string();
        session.pass_ticket = "pt-1".to_string();
        session.base_request = BaseRequest {
            uin: 1001,
            sid: "sid-1".to_string(),
            skey: "@crypt_test".to_string(),
            device_id: session.device_id.clone(),
        };
        session.update_sync_key(numeric_sync_key(&[(1, 100), (2, 200)]));
        session.phase = Phase::Active;
    }

    {
        let mut directory = client.directory.write();
        directory.refresh_own_identity(member("@self", "Me"));
        directory.replace_members(vec![
            member("@self", "Me"),
            Member {
                remark_name: "Friend Remark".to_string(),
                ..member("@friend", "Friend")
            },
            member("@@room", "Room"),
        ]);
    }

    client
}
