//! Message dispatcher
//!
//! Turns raw `AddMsgList` entries into typed [`Message`]s, downloads their
//! attachments and publishes one event per message, in batch order.

use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::client::WechatClient;
use crate::error::{ClientError, ClientResult};
use crate::events::Event;
use crate::gateway::{Decode, GatewayRequest};
use crate::types::{MediaPayload, Message, MessageKind, RawMessage};

static CDN_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"cdnurl ?= ?"(.*?)""#).expect("valid cdnurl pattern"));

/// Sticker download URL embedded in the (HTML-escaped) message content
pub(crate) fn sticker_url(content: &str) -> Option<String> {
    let content = unescape_html(content);
    CDN_URL_RE
        .captures(&content)
        .map(|caps| caps[1].to_string())
        .filter(|url| !url.is_empty())
}

fn unescape_html(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Wrap a message into its notification; `Ignored` has none
fn message_event(message: Message) -> Option<Event> {
    let event = match message.kind {
        MessageKind::StatusNotify => Event::StatusNotify(message),
        MessageKind::Text => Event::Text(message),
        MessageKind::Image => Event::Image(message),
        MessageKind::Voice => Event::Voice(message),
        MessageKind::Sticker => Event::Sticker(message),
        MessageKind::VerifyRequest => Event::VerifyRequest(message),
        MessageKind::Ignored => return None,
    };
    Some(event)
}

impl WechatClient {
    /// Publish a fetched batch in order, returning the number of events
    ///
    /// Stops publishing as soon as the client is stopped.
    pub(crate) async fn dispatch_batch(&self, batch: Vec<RawMessage>) -> usize {
        let mut published = 0;

        for raw in batch {
            if self.is_stopped() {
                debug!(
                    "Client stopped, dropping message {} and the rest of the batch",
                    raw.msg_id
                );
                break;
            }
            let mut message = self.build_message(raw);
            if message.kind == MessageKind::Ignored {
                debug!(
                    "Ignoring message {} of type {}",
                    message.id, message.msg_type
                );
                continue;
            }

            if message.kind.needs_media() {
                let media = self.fetch_media(&message).await;
                if let Err(err) = &media {
                    warn!("Media for message {} unavailable: {}", message.id, err);
                }
                message.media = Some(media);
                if self.is_stopped() {
                    debug!(
                        "Client stopped during download, dropping message {}",
                        message.id
                    );
                    break;
                }
            }

            debug!(
                "{:?} message {} from {} to {}",
                message.kind, message.id, message.from_name, message.to_name
            );
            if let Some(event) = message_event(message) {
                self.events.dispatch(&event);
                published += 1;
            }
        }

        published
    }

    /// Classify a raw message and resolve both parties against the directory
    pub(crate) fn build_message(&self, raw: RawMessage) -> Message {
        let directory = self.directory.read();
        Message {
            kind: MessageKind::from_msg_type(raw.msg_type),
            msg_type: raw.msg_type,
            from_self: directory.is_self(&raw.from_user_name),
            to_self: directory.is_self(&raw.to_user_name),
            from_name: directory.resolve_name(&raw.from_user_name),
            to_name: directory.resolve_name(&raw.to_user_name),
            id: raw.msg_id,
            raw_content: raw.content,
            from_id: raw.from_user_name,
            to_id: raw.to_user_name,
            media: None,
        }
    }

    async fn fetch_media(&self, message: &Message) -> ClientResult<MediaPayload> {
        let (request, url) = match message.kind {
            MessageKind::Image | MessageKind::Voice => {
                let endpoint = {
                    let endpoints = self.endpoints.read();
                    if message.kind == MessageKind::Image {
                        endpoints.msg_image.clone()
                    } else {
                        endpoints.voice.clone()
                    }
                };
                let skey = self.session.read().skey.clone();
                let request = GatewayRequest::get(endpoint)
                    .query("MsgID", &message.id)
                    .query("skey", skey);
                (request, None)
            }
            MessageKind::Sticker => {
                let url = sticker_url(&message.raw_content).ok_or_else(|| {
                    ClientError::media_fetch(format!("sticker {} carries no cdnurl", message.id))
                })?;
                (GatewayRequest::get(url.clone()), Some(url))
            }
            _ => {
                return Err(ClientError::media_fetch(format!(
                    "{:?} messages carry no media",
                    message.kind
                )));
            }
        };

        let response = self
            .execute(request.decode(Decode::Binary))
            .await
            .map_err(|e| {
                ClientError::media_fetch_with(format!("download for message {} failed", message.id), e)
            })?;
        Ok(MediaPayload {
            content_type: response.content_type().map(str::to_string),
            data: response.into_bytes(),
            url,
        })
    }
}
