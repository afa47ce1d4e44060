//! Contact directory
//!
//! Holds the operator's own identity, the flat member list and the
//! partitions derived from it. Partitions are recomputed wholesale on every
//! refresh.

use serde_json::json;
use tracing::{debug, info};

use crate::client::{WechatClient, now_millis};
use crate::error::{ClientError, ClientResult};
use crate::events::Event;
use crate::gateway::{Decode, GatewayRequest};
use crate::session::Phase;
use crate::types::{
    BatchContactResponse, ContactResponse, Friend, GroupContact, MediaPayload, Member,
    SPECIAL_USERS,
};

/// Display name used for the operator's own id
pub const SELF_NAME: &str = "self";

/// Prefix of group entries in the friend list
const GROUP_PREFIX: &str = "群聊: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Official,
    Special,
    Group,
    Contact,
}

/// Partition of a member, by priority: official flag, special id, group
/// marker, personal contact
pub fn classify(member: &Member) -> Partition {
    if member.is_official() {
        Partition::Official
    } else if SPECIAL_USERS.contains(&member.user_name.as_str()) {
        Partition::Special
    } else if member.is_group() {
        Partition::Group
    } else {
        Partition::Contact
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContactDirectory {
    own_user: Option<Member>,
    members: Vec<Member>,
    contacts: Vec<Member>,
    groups: Vec<Member>,
    group_members: Vec<Member>,
    official: Vec<Member>,
    special: Vec<Member>,
}

impl ContactDirectory {
    pub fn refresh_own_identity(&mut self, user: Member) {
        self.own_user = Some(user);
    }

    pub fn own_user(&self) -> Option<&Member> {
        self.own_user.as_ref()
    }

    pub fn own_id(&self) -> Option<&str> {
        self.own_user.as_ref().map(|user| user.user_name.as_str())
    }

    /// Replace the member list and rebuild every partition from it
    pub fn replace_members(&mut self, members: Vec<Member>) {
        self.contacts.clear();
        self.groups.clear();
        self.official.clear();
        self.special.clear();

        for member in &members {
            let partition = match classify(member) {
                Partition::Official => &mut self.official,
                Partition::Special => &mut self.special,
                Partition::Group => &mut self.groups,
                Partition::Contact => &mut self.contacts,
            };
            partition.push(member.clone());
        }
        self.members = members;
    }

    pub fn replace_group_members(&mut self, groups: Vec<GroupContact>) {
        self.group_members = groups
            .into_iter()
            .flat_map(|group| group.member_list)
            .collect();
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn contacts(&self) -> &[Member] {
        &self.contacts
    }

    pub fn groups(&self) -> &[Member] {
        &self.groups
    }

    pub fn group_members(&self) -> &[Member] {
        &self.group_members
    }

    pub fn official_accounts(&self) -> &[Member] {
        &self.official
    }

    pub fn special_accounts(&self) -> &[Member] {
        &self.special
    }

    pub fn find(&self, id: &str) -> Option<&Member> {
        self.members.iter().find(|member| member.user_name == id)
    }

    pub fn is_self(&self, id: &str) -> bool {
        self.own_id() == Some(id)
    }

    /// `"self"` for the own id, then the directory display name, then the id
    pub fn resolve_name(&self, id: &str) -> String {
        if self.is_self(id) {
            return SELF_NAME.to_string();
        }
        match self.find(id) {
            Some(member) => member.display_name().to_string(),
            None => {
                debug!("Unknown user {}", id);
                id.to_string()
            }
        }
    }

    /// Groups then personal contacts, with absolute avatar URLs
    pub fn friend_list(&self, head_image_origin: &str) -> Vec<Friend> {
        let groups = self.groups.iter().map(|member| Friend {
            username: member.user_name.clone(),
            nickname: format!("{}{}", GROUP_PREFIX, member.nick_name),
            py: member.pinyin_key().to_string(),
            avatar: format!("{}{}", head_image_origin, member.head_img_url),
        });
        let contacts = self.contacts.iter().map(|member| Friend {
            username: member.user_name.clone(),
            nickname: member.display_name().to_string(),
            py: member.pinyin_key().to_string(),
            avatar: format!("{}{}", head_image_origin, member.head_img_url),
        });
        groups.chain(contacts).collect()
    }
}

impl WechatClient {
    /// Fetch the member list and rebuild the partitions
    pub async fn refresh_member_list(&self) -> ClientResult<Vec<Member>> {
        self.ensure_running()?;
        let skey = self.session.read().skey.clone();
        let endpoint = self.endpoints.read().contact.clone();
        let request = GatewayRequest::post(endpoint)
            .query("lang", &self.config.lang)
            .query("seq", 0)
            .query("skey", skey)
            .query("r", now_millis())
            .decode(Decode::Json);

        let value = self
            .execute(request)
            .await
            .and_then(|response| response.into_json())
            .map_err(|e| ClientError::directory_with("contact list request failed", e))?;
        let response: ContactResponse = serde_json::from_value(value)
            .map_err(|e| ClientError::directory_with("malformed contact list", e))?;

        if response.member_list.is_empty() {
            return Err(ClientError::directory("contact list is empty"));
        }
        let members = response.member_list;

        self.directory.write().replace_members(members.clone());
        self.session.write().phase = Phase::Active;

        info!("Contact list loaded: {} members", members.len());
        self.events.dispatch(&Event::DirectoryReady(members.clone()));
        Ok(members)
    }

    /// Fetch the members of every known group in one batched request
    pub async fn refresh_group_members(&self) -> ClientResult<usize> {
        self.ensure_running()?;
        let groups: Vec<String> = self
            .directory
            .read()
            .groups()
            .iter()
            .map(|group| group.user_name.clone())
            .collect();
        if groups.is_empty() {
            self.directory.write().replace_group_members(Vec::new());
            debug!("No groups, skipping group member fetch");
            return Ok(0);
        }

        let base_request = self.session.read().base_request.clone();
        let list: Vec<_> = groups
            .iter()
            .map(|id| json!({ "UserName": id, "EncryChatRoomId": "" }))
            .collect();
        let endpoint = self.endpoints.read().batch_contact.clone();
        let request = GatewayRequest::post(endpoint)
            .query("type", "ex")
            .query("r", now_millis())
            .query("lang", &self.config.lang)
            .json_body(json!({
                "BaseRequest": base_request,
                "Count": groups.len(),
                "List": list,
            }))
            .decode(Decode::Json);

        let value = self
            .execute(request)
            .await
            .and_then(|response| response.into_json())
            .map_err(|e| ClientError::directory_with("group member request failed", e))?;
        let response: BatchContactResponse = serde_json::from_value(value)
            .map_err(|e| ClientError::directory_with("malformed group member list", e))?;

        let mut directory = self.directory.write();
        directory.replace_group_members(response.contact_list);
        let count = directory.group_members().len();
        info!("Group members loaded: {}", count);
        Ok(count)
    }

    /// Download a member's avatar
    pub async fn fetch_head_image(&self, member: &Member) -> ClientResult<MediaPayload> {
        let origin = self.endpoints.read().head_image_origin.clone();
        if origin.is_empty() {
            return Err(ClientError::media_fetch("no web host, session not confirmed"));
        }
        let url = format!("{}{}", origin, member.head_img_url);
        let request = GatewayRequest::get(url.clone()).decode(Decode::Binary);

        let response = self
            .execute(request)
            .await
            .map_err(|e| ClientError::media_fetch_with("avatar download failed", e))?;
        Ok(MediaPayload {
            content_type: response.content_type().map(str::to_string),
            data: response.into_bytes(),
            url: Some(url),
        })
    }
}
