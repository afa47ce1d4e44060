//! Error taxonomy for the client
//!
//! Every public operation wraps lower-level failures (transport, decoding)
//! into one of the domain variants below, keeping the underlying cause as
//! `source`.

use std::error::Error as StdError;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Client error type
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Malformed or unexpected response shape
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// A handshake step was rejected or a credential field was missing
    #[error("Login error: {message}")]
    Login {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Contact fetch returned an empty or invalid payload
    #[error("Directory error: {message}")]
    Directory {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Sync check or sync fetch failed or returned a non-zero status
    #[error("Sync error: {message}")]
    Sync {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Attachment retrieval failed
    #[error("Media fetch error: {message}")]
    MediaFetch {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Outgoing message rejected or not delivered
    #[error("Send error: {message}")]
    Send {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Raised by the request gateway
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The pending confirmation waiter was replaced by a fresh ticket
    #[error("Login ticket reloaded")]
    Reload,

    /// Returned by `start()` after teardown was attempted
    #[error("Startup failed: {0}")]
    Startup(#[source] Box<ClientError>),

    /// The client was stopped while the operation was in flight
    #[error("Client stopped")]
    Stopped,
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

macro_rules! domain_ctor {
    ($name:ident, $with:ident, $variant:ident) => {
        pub fn $name(message: impl Into<String>) -> Self {
            ClientError::$variant {
                message: message.into(),
                source: None,
            }
        }

        pub fn $with(
            message: impl Into<String>,
            source: impl Into<BoxError>,
        ) -> Self {
            ClientError::$variant {
                message: message.into(),
                source: Some(source.into()),
            }
        }
    };
}

impl ClientError {
    domain_ctor!(protocol, protocol_with, Protocol);
    domain_ctor!(login, login_with, Login);
    domain_ctor!(directory, directory_with, Directory);
    domain_ctor!(sync, sync_with, Sync);
    domain_ctor!(media_fetch, media_fetch_with, MediaFetch);
    domain_ctor!(send, send_with, Send);
    domain_ctor!(transport, transport_with, Transport);

    /// Short lowercase label used in logs and events
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::Protocol { .. } => "protocol",
            ClientError::Login { .. } => "login",
            ClientError::Directory { .. } => "directory",
            ClientError::Sync { .. } => "sync",
            ClientError::MediaFetch { .. } => "media_fetch",
            ClientError::Send { .. } => "send",
            ClientError::Transport { .. } => "transport",
            ClientError::Reload => "reload",
            ClientError::Startup(_) => "startup",
            ClientError::Stopped => "stopped",
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::transport_with(err.to_string(), err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_source_is_kept() {
        let err = ClientError::sync_with("sync fetch failed", ClientError::transport("reset"));
        assert_eq!(err.kind(), "sync");
        assert_eq!(err.to_string(), "Sync error: sync fetch failed");

        let source = err.source().expect("source should be kept");
        assert_eq!(source.to_string(), "Transport error: reset");
    }

    #[test]
    fn test_startup_summary() {
        let err = ClientError::Startup(Box::new(ClientError::directory("empty member list")));
        assert_eq!(
            err.to_string(),
            "Startup failed: Directory error: empty member list"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn test_http_client_error_keeps_cause() {
        let cause = reqwest::Client::new().get("not a url").build().unwrap_err();
        let expected = cause.to_string();

        let err: ClientError = cause.into();
        assert_eq!(err.kind(), "transport");
        assert_eq!(err.to_string(), format!("Transport error: {}", expected));

        let source = err.source().expect("reqwest error should be kept");
        assert!(source.downcast_ref::<reqwest::Error>().is_some());
    }
}
