use std::fmt;

use axum::body::Bytes;
use serde::Serialize;

use crate::error::CaseEventsError;

/// Opaque identifier of a case (collaboration thread).
///
/// Not validated. The empty id stands for "no case" and turns every
/// broadcaster operation into a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct CaseId(String);

impl CaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CaseId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CaseId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&String> for CaseId {
    fn from(id: &String) -> Self {
        Self(id.clone())
    }
}

impl From<&CaseId> for CaseId {
    fn from(id: &CaseId) -> Self {
        id.clone()
    }
}

// Numeric ids coming from the datastore are coerced to their decimal form.
impl From<u64> for CaseId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<i64> for CaseId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

/// Event names published by the case, message and invitation handlers.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum EventKind {
    CaseUpdate,
    NewMessage,
    DocumentUpload,
    Invitation,
    PaymentUpdate,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        (*self).into()
    }
}

impl From<EventKind> for &'static str {
    fn from(kind: EventKind) -> &'static str {
        match kind {
            EventKind::CaseUpdate => "case_update",
            EventKind::NewMessage => "new_message",
            EventKind::DocumentUpload => "document_upload",
            EventKind::Invitation => "invitation",
            EventKind::PaymentUpdate => "payment_update",
        }
    }
}

impl TryFrom<&str> for EventKind {
    type Error = String;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        match name {
            "case_update" => Ok(EventKind::CaseUpdate),
            "new_message" => Ok(EventKind::NewMessage),
            "document_upload" => Ok(EventKind::DocumentUpload),
            "invitation" => Ok(EventKind::Invitation),
            "payment_update" => Ok(EventKind::PaymentUpdate),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

impl AsRef<str> for EventKind {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialize `payload` and frame it as one event-stream message:
/// `event: {name}\ndata: {json}\n\n`.
///
/// The payload is rejected when its JSON form exceeds `max_payload_bytes`.
pub fn encode<P>(name: &str, payload: &P, max_payload_bytes: usize) -> Result<Bytes, CaseEventsError>
where
    P: Serialize + ?Sized,
{
    if name.contains(['\r', '\n']) {
        return Err(CaseEventsError::InvalidEventName(name.to_string()));
    }

    // serde_json never emits raw line breaks in compact output, so `data:`
    // always stays on one line.
    let data = serde_json::to_string(payload)?;
    if data.len() > max_payload_bytes {
        return Err(CaseEventsError::PayloadTooLarge {
            size: data.len(),
            limit: max_payload_bytes,
        });
    }

    Ok(Bytes::from(format!("event: {name}\ndata: {data}\n\n")))
}
