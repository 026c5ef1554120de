use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A connectivity candidate as exchanged between the browser and the media engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: u32,
}

/// Callee decision carried by `incomingCallResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDecision {
    Accept,
    /// Anything other than `accept` declines the call.
    #[serde(other)]
    Reject,
}

/// Messages sent from browser clients to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ClientMessage {
    Register {
        #[serde(default)]
        name: String,
    },
    Call {
        #[serde(default)]
        to: String,
        #[serde(default)]
        from: String,
        #[serde(rename = "sdpOffer", default)]
        sdp_offer: Option<String>,
    },
    IncomingCallResponse {
        #[serde(default)]
        from: Option<String>,
        #[serde(rename = "callResponse")]
        call_response: CallDecision,
        #[serde(rename = "sdpOffer", default)]
        sdp_offer: Option<String>,
    },
    Stop,
    OnIceCandidate { candidate: IceCandidate },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    Rejected,
}

/// Messages sent from the server to browser clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ServerMessage {
    RegisterResponse {
        response: Verdict,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    CallResponse {
        response: Verdict,
        #[serde(rename = "sdpAnswer", default, skip_serializing_if = "Option::is_none")]
        sdp_answer: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    IncomingCall {
        from: String,
    },
    StartCommunication {
        #[serde(rename = "sdpAnswer")]
        sdp_answer: String,
    },
    StopCommunication {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    IceCandidate {
        candidate: IceCandidate,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn register_accepted() -> Self {
        ServerMessage::RegisterResponse {
            response: Verdict::Accepted,
            message: None,
        }
    }

    pub fn register_rejected(reason: impl Into<String>) -> Self {
        ServerMessage::RegisterResponse {
            response: Verdict::Rejected,
            message: Some(reason.into()),
        }
    }

    pub fn call_accepted(sdp_answer: String) -> Self {
        ServerMessage::CallResponse {
            response: Verdict::Accepted,
            sdp_answer: Some(sdp_answer),
            message: None,
        }
    }

    pub fn call_rejected(reason: impl Into<String>) -> Self {
        ServerMessage::CallResponse {
            response: Verdict::Rejected,
            sdp_answer: None,
            message: Some(reason.into()),
        }
    }

    pub fn stop_communication(reason: Option<String>) -> Self {
        ServerMessage::StopCommunication { message: reason }
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("Invalid message {raw}")]
    Malformed {
        raw: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SignalingError {
    pub fn into_reply(self) -> ServerMessage {
        ServerMessage::Error {
            message: self.to_string(),
        }
    }
}

/// Decode one inbound text frame. Unknown kinds and malformed payloads are
/// reported with the raw input echoed back.
pub fn decode_client_message(raw: &str) -> Result<ClientMessage, SignalingError> {
    serde_json::from_str(raw).map_err(|source| SignalingError::Malformed {
        raw: raw.to_string(),
        source,
    })
}
