//! Wire types for the WeChat Web protocol and the typed message model

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

// =============================================================================
// Protocol Constants
// =============================================================================

pub const SYNCCHECK_RET_SUCCESS: u32 = 0;
pub const SYNCCHECK_SELECTOR_NORMAL: u32 = 0;

/// `VerifyFlag` bit carried by official accounts
pub const VERIFY_FLAG_OFFICIAL: u32 = 8;

/// Marker contained in every group id
pub const GROUP_ID_MARKER: &str = "@@";

/// Built-in service accounts that are neither contacts nor official accounts
pub const SPECIAL_USERS: &[&str] = &[
    "newsapp",
    "fmessage",
    "filehelper",
    "weibo",
    "qqmail",
    "tmessage",
    "qmessage",
    "qqsync",
    "floatbottle",
    "lbsapp",
    "shakeapp",
    "medianote",
    "qqfriend",
    "readerapp",
    "blogapp",
    "facebookapp",
    "masssendapp",
    "meishiapp",
    "feedsapp",
    "voip",
    "blogappweixin",
    "weixin",
    "brandsessionholder",
    "weixinreminder",
    "wxid_novlwrv3lqwv11",
    "gh_22b87fa7cb3c",
    "officialaccounts",
    "notification_messages",
    "wxitil",
    "userexperience_alarm",
];

/// Numeric `MsgType` values
pub mod msg_type {
    pub const TEXT: u32 = 1;
    pub const IMAGE: u32 = 3;
    pub const VOICE: u32 = 34;
    pub const VERIFY: u32 = 37;
    pub const STICKER: u32 = 47;
    pub const STATUS_NOTIFY: u32 = 51;
}

// =============================================================================
// Message Kind
// =============================================================================

/// Classification of an incoming message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    StatusNotify,
    Text,
    Image,
    Voice,
    Sticker,
    VerifyRequest,
    /// Unrecognised type, dropped without a notification
    Ignored,
}

impl MessageKind {
    pub fn from_msg_type(value: u32) -> Self {
        match value {
            msg_type::STATUS_NOTIFY => MessageKind::StatusNotify,
            msg_type::TEXT => MessageKind::Text,
            msg_type::IMAGE => MessageKind::Image,
            msg_type::VOICE => MessageKind::Voice,
            msg_type::STICKER => MessageKind::Sticker,
            msg_type::VERIFY => MessageKind::VerifyRequest,
            _ => MessageKind::Ignored,
        }
    }

    pub fn needs_media(&self) -> bool {
        matches!(
            self,
            MessageKind::Image | MessageKind::Voice | MessageKind::Sticker
        )
    }
}

// =============================================================================
// Responses
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BaseResponse {
    #[serde(rename = "Ret")]
    pub ret: i64,
    #[serde(rename = "ErrMsg", default)]
    pub err_msg: String,
}

/// Redirect target body returned after confirmation
#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "error")]
pub struct LoginCredentials {
    #[serde(default)]
    pub ret: Option<i64>,
    #[serde(default)]
    pub skey: Option<String>,
    #[serde(default)]
    pub wxsid: Option<String>,
    #[serde(default)]
    pub wxuin: Option<String>,
    #[serde(default)]
    pub pass_ticket: Option<String>,
}

/// Opaque sync key component, numeric or textual as the server sent it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SyncValue {
    Number(i64),
    Text(String),
}

impl std::fmt::Display for SyncValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncValue::Number(n) => write!(f, "{}", n),
            SyncValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncKeyPair {
    #[serde(rename = "Key")]
    pub key: SyncValue,
    #[serde(rename = "Val")]
    pub val: SyncValue,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncKey {
    #[serde(rename = "Count", default)]
    pub count: usize,
    #[serde(rename = "List", default)]
    pub list: Vec<SyncKeyPair>,
}

impl SyncKey {
    /// `key_val` pairs joined by `|`, in server order
    pub fn format(&self) -> String {
        self.list
            .iter()
            .map(|pair| format!("{}_{}", pair.key, pair.val))
            .collect::<Vec<_>>()
            .join("|")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitResponse {
    #[serde(rename = "BaseResponse")]
    pub base_response: BaseResponse,
    #[serde(rename = "User", default)]
    pub user: Option<Member>,
    #[serde(rename = "SyncKey", default)]
    pub sync_key: Option<SyncKey>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    #[serde(rename = "BaseResponse")]
    pub base_response: BaseResponse,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContactResponse {
    #[serde(rename = "BaseResponse", default)]
    pub base_response: BaseResponse,
    #[serde(rename = "MemberList", default)]
    pub member_list: Vec<Member>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchContactResponse {
    #[serde(rename = "BaseResponse", default)]
    pub base_response: BaseResponse,
    #[serde(rename = "ContactList", default)]
    pub contact_list: Vec<GroupContact>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupContact {
    #[serde(rename = "UserName")]
    pub user_name: String,
    #[serde(rename = "MemberList", default)]
    pub member_list: Vec<Member>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncResponse {
    #[serde(rename = "BaseResponse")]
    pub base_response: BaseResponse,
    #[serde(rename = "AddMsgList", default)]
    pub add_msg_list: Vec<RawMessage>,
    #[serde(rename = "SyncKey", default)]
    pub sync_key: Option<SyncKey>,
}

/// Message as delivered in `AddMsgList`
#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    #[serde(rename = "MsgId")]
    pub msg_id: String,
    #[serde(rename = "MsgType")]
    pub msg_type: u32,
    #[serde(rename = "Content", default)]
    pub content: String,
    #[serde(rename = "FromUserName")]
    pub from_user_name: String,
    #[serde(rename = "ToUserName")]
    pub to_user_name: String,
}

// =============================================================================
// Member
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    #[serde(rename = "UserName")]
    pub user_name: String,
    #[serde(rename = "NickName", default)]
    pub nick_name: String,
    #[serde(rename = "RemarkName", default)]
    pub remark_name: String,
    #[serde(rename = "PYQuanPin", default)]
    pub py_quan_pin: String,
    #[serde(rename = "RemarkPYQuanPin", default)]
    pub remark_py_quan_pin: String,
    #[serde(rename = "VerifyFlag", default)]
    pub verify_flag: u32,
    #[serde(rename = "HeadImgUrl", default)]
    pub head_img_url: String,
}

impl Member {
    /// Remark name when set, nick name otherwise
    pub fn display_name(&self) -> &str {
        if self.remark_name.is_empty() {
            &self.nick_name
        } else {
            &self.remark_name
        }
    }

    pub fn pinyin_key(&self) -> &str {
        if self.remark_py_quan_pin.is_empty() {
            &self.py_quan_pin
        } else {
            &self.remark_py_quan_pin
        }
    }

    pub fn is_official(&self) -> bool {
        self.verify_flag & VERIFY_FLAG_OFFICIAL != 0
    }

    pub fn is_group(&self) -> bool {
        self.user_name.contains(GROUP_ID_MARKER)
    }
}

// =============================================================================
// Typed Message
// =============================================================================

/// Attachment downloaded for an image, voice or sticker message
#[derive(Debug, Clone)]
pub struct MediaPayload {
    pub data: Bytes,
    pub content_type: Option<String>,
    /// Source URL (stickers only)
    pub url: Option<String>,
}

/// Classified and enriched message, published on the event bus
#[derive(Debug)]
pub struct Message {
    pub id: String,
    pub kind: MessageKind,
    pub msg_type: u32,
    pub raw_content: String,
    pub from_id: String,
    pub to_id: String,
    pub from_self: bool,
    pub to_self: bool,
    pub from_name: String,
    pub to_name: String,
    /// Set before publication for media kinds
    pub media: Option<Result<MediaPayload, ClientError>>,
}

impl Message {
    pub fn media_payload(&self) -> Option<&MediaPayload> {
        self.media.as_ref().and_then(|m| m.as_ref().ok())
    }

    pub fn media_error(&self) -> Option<&ClientError> {
        self.media.as_ref().and_then(|m| m.as_ref().err())
    }
}

/// Entry of the operator-facing friend list
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Friend {
    pub username: String,
    pub nickname: String,
    pub py: String,
    pub avatar: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_key_format() {
        let sync_key = SyncKey {
            count: 2,
            list: vec![
                SyncKeyPair {
                    key: SyncValue::Number(1),
                    val: SyncValue::Number(100),
                },
                SyncKeyPair {
                    key: SyncValue::Number(2),
                    val: SyncValue::Number(200),
                },
            ],
        };
        assert_eq!(sync_key.format(), "1_100|2_200");
        assert_eq!(SyncKey::default().format(), "");
    }

    #[test]
    fn test_sync_key_textual_pairs() {
        let sync_key: SyncKey = serde_json::from_value(serde_json::json!({
            "Count": 2,
            "List": [{"Key": "1", "Val": "a"}, {"Key": "2", "Val": "b"}]
        }))
        .unwrap();
        assert_eq!(sync_key.format(), "1_a|2_b");

        // Echoed back to the server with the same value types
        let echoed = serde_json::to_value(&sync_key).unwrap();
        assert_eq!(echoed["List"][0]["Key"], "1");
        assert_eq!(echoed["List"][1]["Val"], "b");
    }

    #[test]
    fn test_sync_key_mixed_pairs() {
        let sync_key: SyncKey = serde_json::from_value(serde_json::json!({
            "Count": 2,
            "List": [{"Key": 1, "Val": 650000123}, {"Key": "1000", "Val": "x"}]
        }))
        .unwrap();
        assert_eq!(sync_key.format(), "1_650000123|1000_x");
        assert_eq!(
            serde_json::to_value(&sync_key).unwrap()["List"][0]["Val"],
            650000123
        );
    }

    #[test]
    fn test_message_kind_classification() {
        assert_eq!(MessageKind::from_msg_type(1), MessageKind::Text);
        assert_eq!(MessageKind::from_msg_type(3), MessageKind::Image);
        assert_eq!(MessageKind::from_msg_type(34), MessageKind::Voice);
        assert_eq!(MessageKind::from_msg_type(47), MessageKind::Sticker);
        assert_eq!(MessageKind::from_msg_type(37), MessageKind::VerifyRequest);
        assert_eq!(MessageKind::from_msg_type(51), MessageKind::StatusNotify);
        assert_eq!(MessageKind::from_msg_type(49), MessageKind::Ignored);
        assert!(MessageKind::Sticker.needs_media());
        assert!(!MessageKind::Text.needs_media());
    }

    #[test]
    fn test_member_parsing() {
        let json = r#"{
            "UserName": "@abc",
            "NickName": "Alice",
            "RemarkName": "",
            "PYQuanPin": "alice",
            "RemarkPYQuanPin": "",
            "VerifyFlag": 24,
            "HeadImgUrl": "/cgi-bin/mmwebwx-bin/webwxgeticon?username=@abc"
        }"#;
        let member: Member = serde_json::from_str(json).unwrap();
        assert_eq!(member.display_name(), "Alice");
        assert_eq!(member.pinyin_key(), "alice");
        assert!(member.is_official());
        assert!(!member.is_group());
    }

    #[test]
    fn test_login_credentials_parsing() {
        let xml = "<error><ret>0</ret><message></message><skey>@crypt_1</skey>\
                   <wxsid>sid1</wxsid><wxuin>12345</wxuin>\
                   <pass_ticket>pt%2B1</pass_ticket><isgrayscale>1</isgrayscale></error>";
        let creds: LoginCredentials = serde_xml_rs::from_str(xml).unwrap();
        assert_eq!(creds.ret, Some(0));
        assert_eq!(creds.skey.as_deref(), Some("@crypt_1"));
        assert_eq!(creds.wxsid.as_deref(), Some("sid1"));
        assert_eq!(creds.wxuin.as_deref(), Some("12345"));
        assert_eq!(creds.pass_ticket.as_deref(), Some("pt%2B1"));
    }
}
