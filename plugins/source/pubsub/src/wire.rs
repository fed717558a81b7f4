//! JSON bodies of the Pub/Sub REST v1 subscription methods.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PullRequest {
    pub max_messages: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PullResponse {
    /// Omitted entirely when nothing is available.
    #[serde(default)]
    pub received_messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReceivedMessage {
    pub ack_id: String,
    pub message: PubsubMessage,
    /// Only populated when the subscription has a dead-letter policy.
    #[serde(default)]
    pub delivery_attempt: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PubsubMessage {
    /// Standard base64. Absent for attribute-only messages.
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub message_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AcknowledgeRequest<'a> {
    pub ack_ids: &'a [&'a str],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ModifyAckDeadlineRequest<'a> {
    pub ack_ids: &'a [&'a str],
    pub ack_deadline_seconds: u32,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: String,
}
