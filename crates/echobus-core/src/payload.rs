//! Call argument and reply payload types.
//!
//! Payloads travel over the bus as JSON values. The types here give the
//! echo service a typed view of them, tolerant of absent or malformed
//! fields the way a bus argument policy is: anything that does not parse
//! falls back to defaults.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BusError, BusResult};

/// Substituted for the message text when the caller omitted the field.
pub const PLACEHOLDER_MESSAGE: &str = "(unknown)";

/// Connective text between object name and message in a reply.
const REPLY_INFIX: &str = " received a message: ";

/// Arguments accepted by both `echo` and `longecho`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EchoArgs {
    /// The message to echo back. Optional; absent falls back to
    /// [`PLACEHOLDER_MESSAGE`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl EchoArgs {
    /// Parse call arguments, tolerating absent or malformed fields.
    ///
    /// A payload that does not match the declared shape is treated the same
    /// as an empty one, mirroring how a bus argument policy silently skips
    /// fields of the wrong type.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

/// Reply payload sent by both `echo` and `longecho`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoReply {
    /// The formatted reply text.
    pub message: String,
}

impl From<EchoReply> for Value {
    fn from(reply: EchoReply) -> Self {
        serde_json::json!({ "message": reply.message })
    }
}

/// Build the reply text `"<object> received a message: <message>"`.
///
/// A `None` message substitutes [`PLACEHOLDER_MESSAGE`]. The buffer is
/// reserved fallibly; exhaustion maps to [`BusError::OutOfMemory`] and the
/// call is failed without a reply.
pub fn format_reply(object_name: &str, message: Option<&str>) -> BusResult<String> {
    let message = message.unwrap_or(PLACEHOLDER_MESSAGE);

    let mut out = String::new();
    out.try_reserve(object_name.len() + REPLY_INFIX.len() + message.len())
        .map_err(|_| BusError::OutOfMemory)?;
    out.push_str(object_name);
    out.push_str(REPLY_INFIX);
    out.push_str(message);
    Ok(out)
}
