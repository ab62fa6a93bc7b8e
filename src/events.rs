//! Filter for inbound mailbox change events.
//!
//! The primary exports one event per finished IMAP command. Only commands
//! that can mutate mailbox state warrant a replication, so reads (FETCH,
//! SEARCH, …) and session plumbing (LOGIN, IDLE, …) are rejected before
//! they reach the queue.

use serde::Deserialize;

const ACCEPTED_EVENT: &str = "imap_command_finished";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FilterError {
    #[error("invalid event payload: {0}")]
    Payload(String),
    #[error("event field is empty")]
    EmptyEvent,
    #[error("username field is empty")]
    EmptyUsername,
    #[error("event type {0:?} not accepted")]
    UnacceptedEvent(String),
    #[error("command {0:?} not accepted")]
    UnacceptedCommand(String),
}

#[derive(Debug, Deserialize)]
struct ChangeEvent {
    #[serde(default)]
    event: String,
    #[serde(default)]
    fields: EventFields,
}

#[derive(Debug, Default, Deserialize)]
struct EventFields {
    #[serde(default)]
    user: String,
    #[serde(default)]
    cmd_name: String,
}

/// An event that passed validation and should be queued.
#[derive(Debug)]
pub struct AcceptedEvent {
    pub username: String,
    pub cmd_name: String,
}

pub fn filter(data: &[u8]) -> Result<AcceptedEvent, FilterError> {
    let event: ChangeEvent =
        serde_json::from_slice(data).map_err(|err| FilterError::Payload(err.to_string()))?;

    if event.event.is_empty() {
        return Err(FilterError::EmptyEvent);
    }
    if event.event != ACCEPTED_EVENT {
        return Err(FilterError::UnacceptedEvent(event.event));
    }
    if event.fields.user.is_empty() {
        return Err(FilterError::EmptyUsername);
    }
    if !mutates_mailbox(&event.fields.cmd_name) {
        return Err(FilterError::UnacceptedCommand(event.fields.cmd_name));
    }

    Ok(AcceptedEvent {
        username: event.fields.user,
        cmd_name: event.fields.cmd_name,
    })
}

fn mutates_mailbox(cmd_name: &str) -> bool {
    matches!(
        cmd_name.to_ascii_uppercase().as_str(),
        "APPEND"
            | "CLOSE"
            | "COPY"
            | "CREATE"
            | "DELETE"
            | "DELETEACL"
            | "EXPUNGE"
            | "MOVE"
            | "RENAME"
            | "SETACL"
            | "SETMETADATA"
            | "SETQUOTA"
            | "STORE"
            | "SUBSCRIBE"
            | "UID COPY"
            | "UID DELETE"
            | "UID EXPUNGE"
            | "UID MOVE"
            | "UID STORE"
            | "UNSUBSCRIBE"
    )
}
