//! Wire types exchanged with the upstream automation service.

use serde::{Deserialize, Serialize};

/// Correlation id attached to every outbound request.
pub type RequestId = String;

/// Backend API invoked by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiType {
    /// Fetch the contact list; answered on the shared stream.
    GetContact,
    /// Ask the backend to push a fresh login QR code.
    GetQrcode,
    /// Send a chat message.
    SendMessage,
    /// Log the bound account out.
    Logout,
    /// Keepalive.
    Heartbeat,
    /// Initialize a backend instance.
    Init,
}

impl ApiType {
    /// Whether the backend answers this API with a correlated reply on the stream.
    ///
    /// Every other API resolves as soon as the transport acknowledges the send.
    #[must_use]
    pub const fn expects_reply(self) -> bool {
        matches!(self, Self::GetContact)
    }
}

/// Discriminates frames pushed on the shared stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseType {
    /// A login QR code for whichever session has not been bound yet.
    LoginQrcode,
    /// A QR code was scanned on a device.
    QrcodeScan,
    /// An account finished logging in.
    AccountLogin,
    /// An account logged out.
    AccountLogout,
    /// Contact list payload.
    ContactList,
    /// Incoming chat message.
    MessageReceive,
    /// Generic status change.
    StatusNotify,
}

impl ResponseType {
    /// Pushes broadcast to every session still waiting for an identity.
    #[must_use]
    pub const fn is_identity_assignment(self) -> bool {
        matches!(self, Self::LoginQrcode)
    }
}

/// Unary request sent to trigger backend work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestObject {
    pub token: String,
    pub api_type: ApiType,
    /// JSON-encoded parameters, empty when the API takes none.
    pub params: String,
    pub request_id: RequestId,
}

impl RequestObject {
    /// Build a request, serializing `params` to JSON.
    ///
    /// # Errors
    /// Returns error if `params` cannot be serialized.
    pub fn new(
        token: impl Into<String>,
        api_type: ApiType,
        params: Option<&serde_json::Value>,
        request_id: impl Into<RequestId>,
    ) -> Result<Self, serde_json::Error> {
        let params = match params {
            Some(value) => serde_json::to_string(value)?,
            None => String::new(),
        };
        Ok(Self {
            token: token.into(),
            api_type,
            params,
            request_id: request_id.into(),
        })
    }
}

/// Acknowledgement of a unary request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseObject {
    pub result: bool,
}

/// Parameters of the long-lived subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitConfig {
    pub token: String,
}

/// One frame received on the shared stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamResponse {
    /// Empty for unsolicited pushes.
    #[serde(default)]
    pub request_id: RequestId,
    pub response_type: ResponseType,
    /// JSON payload, opaque to the gateway beyond identity extraction.
    #[serde(default)]
    pub data: String,
}

impl StreamResponse {
    /// Create an unsolicited push frame.
    #[must_use]
    pub fn push(response_type: ResponseType, data: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::new(),
            response_type,
            data: data.into(),
        }
    }

    /// Create a reply frame for `request_id`.
    #[must_use]
    pub fn reply(
        request_id: impl Into<RequestId>,
        response_type: ResponseType,
        data: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            response_type,
            data: data.into(),
        }
    }

    /// The correlation id, if this frame answers a request.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        if self.request_id.is_empty() {
            None
        } else {
            Some(&self.request_id)
        }
    }

    /// Parse the payload as JSON.
    ///
    /// # Errors
    /// Returns error if the payload is not valid JSON.
    pub fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_contact_lookup_expects_reply() {
        assert!(ApiType::GetContact.expects_reply());
        assert!(!ApiType::SendMessage.expects_reply());
        assert!(!ApiType::GetQrcode.expects_reply());
    }

    #[test]
    fn test_request_params_serialization() {
        let req = RequestObject::new("tok", ApiType::GetContact, Some(&serde_json::json!({})), "r1")
            .unwrap();
        assert_eq!(req.params, "{}");

        let bare = RequestObject::new("tok", ApiType::Heartbeat, None, "r2").unwrap();
        assert!(bare.params.is_empty());
    }

    #[test]
    fn test_stream_response_wire_names() {
        let json = r#"{"requestId":"","responseType":"LOGIN_QRCODE","data":"{}"}"#;
        let frame: StreamResponse = serde_json::from_str(json).unwrap();
        assert_eq!(frame.response_type, ResponseType::LoginQrcode);
        assert!(frame.correlation_id().is_none());

        let reply = StreamResponse::reply("abc", ResponseType::ContactList, "[]");
        assert_eq!(reply.correlation_id(), Some("abc"));
    }
}
