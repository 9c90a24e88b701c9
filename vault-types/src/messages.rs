//! Relay protocol frames.
//!
//! Every frame is a JSON array whose first element names the message type,
//! sent as a WebSocket text frame.

use serde_json::Value;

use crate::{Event, EventId, Filter, WireError};

/// Frames sent from client to relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["EVENT", event]` - publish an event
    Event(Box<Event>),
    /// `["REQ", sub_id, filter...]` - open a subscription
    Req {
        /// Subscription identifier chosen by the client
        subscription_id: String,
        /// Filters OR-ed together
        filters: Vec<Filter>,
    },
    /// `["CLOSE", sub_id]` - end a subscription
    Close(String),
}

impl ClientMessage {
    /// Encode as a JSON array.
    pub fn to_json(&self) -> Result<String, WireError> {
        let value = match self {
            ClientMessage::Event(event) => {
                Value::Array(vec![Value::from("EVENT"), serde_json::to_value(event)?])
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut parts = vec![Value::from("REQ"), Value::from(subscription_id.as_str())];
                for filter in filters {
                    parts.push(serde_json::to_value(filter)?);
                }
                Value::Array(parts)
            }
            ClientMessage::Close(subscription_id) => Value::Array(vec![
                Value::from("CLOSE"),
                Value::from(subscription_id.as_str()),
            ]),
        };
        Ok(value.to_string())
    }

    /// Decode from a JSON array.
    pub fn from_json(json: &str) -> Result<Self, WireError> {
        let parts = frame_parts(json)?;
        match label(&parts)? {
            "EVENT" => {
                let event = parts
                    .get(1)
                    .cloned()
                    .ok_or_else(|| missing("EVENT", "event"))?;
                Ok(ClientMessage::Event(Box::new(serde_json::from_value(event)?)))
            }
            "REQ" => {
                let subscription_id = string_at(&parts, 1, "REQ", "subscription id")?;
                let filters = parts[2..]
                    .iter()
                    .cloned()
                    .map(serde_json::from_value)
                    .collect::<Result<Vec<Filter>, _>>()?;
                Ok(ClientMessage::Req {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => Ok(ClientMessage::Close(string_at(
                &parts,
                1,
                "CLOSE",
                "subscription id",
            )?)),
            other => Err(WireError::InvalidMessage(format!(
                "unknown client message type: {}",
                other
            ))),
        }
    }
}

/// Frames sent from relay to client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", sub_id, event]` - a stored or live event
    Event {
        /// Subscription the event belongs to
        subscription_id: String,
        /// The event
        event: Box<Event>,
    },
    /// `["OK", event_id, accepted, message]` - publish acknowledgement
    Ok {
        /// Event being acknowledged
        event_id: EventId,
        /// Whether the relay stored it
        accepted: bool,
        /// Machine-readable prefix plus human text, may be empty
        message: String,
    },
    /// `["EOSE", sub_id]` - end of stored events
    Eose(String),
    /// `["CLOSED", sub_id, message]` - relay ended a subscription
    Closed {
        /// Subscription that was ended
        subscription_id: String,
        /// Reason given by the relay
        message: String,
    },
    /// `["NOTICE", message]` - human-readable notice
    Notice(String),
}

impl RelayMessage {
    /// Encode as a JSON array.
    pub fn to_json(&self) -> Result<String, WireError> {
        let value = match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => Value::Array(vec![
                Value::from("EVENT"),
                Value::from(subscription_id.as_str()),
                serde_json::to_value(event)?,
            ]),
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => Value::Array(vec![
                Value::from("OK"),
                Value::from(event_id.to_hex()),
                Value::from(*accepted),
                Value::from(message.as_str()),
            ]),
            RelayMessage::Eose(subscription_id) => Value::Array(vec![
                Value::from("EOSE"),
                Value::from(subscription_id.as_str()),
            ]),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => Value::Array(vec![
                Value::from("CLOSED"),
                Value::from(subscription_id.as_str()),
                Value::from(message.as_str()),
            ]),
            RelayMessage::Notice(message) => {
                Value::Array(vec![Value::from("NOTICE"), Value::from(message.as_str())])
            }
        };
        Ok(value.to_string())
    }

    /// Decode from a JSON array.
    pub fn from_json(json: &str) -> Result<Self, WireError> {
        let parts = frame_parts(json)?;
        match label(&parts)? {
            "EVENT" => {
                let subscription_id = string_at(&parts, 1, "EVENT", "subscription id")?;
                let event = parts
                    .get(2)
                    .cloned()
                    .ok_or_else(|| missing("EVENT", "event"))?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event: Box::new(serde_json::from_value(event)?),
                })
            }
            "OK" => {
                let event_id = EventId::from_hex(&string_at(&parts, 1, "OK", "event id")?)?;
                let accepted = parts
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| missing("OK", "accepted flag"))?;
                // Some relays omit the message entirely
                let message = parts
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(RelayMessage::Ok {
                    event_id,
                    accepted,
                    message,
                })
            }
            "EOSE" => Ok(RelayMessage::Eose(string_at(
                &parts,
                1,
                "EOSE",
                "subscription id",
            )?)),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: string_at(&parts, 1, "CLOSED", "subscription id")?,
                message: parts
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "NOTICE" => Ok(RelayMessage::Notice(string_at(
                &parts, 1, "NOTICE", "message",
            )?)),
            other => Err(WireError::InvalidMessage(format!(
                "unknown relay message type: {}",
                other
            ))),
        }
    }
}

fn frame_parts(json: &str) -> Result<Vec<Value>, WireError> {
    match serde_json::from_str::<Value>(json)? {
        Value::Array(parts) if !parts.is_empty() => Ok(parts),
        _ => Err(WireError::InvalidMessage(
            "frame is not a non-empty JSON array".into(),
        )),
    }
}

fn label(parts: &[Value]) -> Result<&str, WireError> {
    parts
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| WireError::InvalidMessage("frame type is not a string".into()))
}

fn string_at(
    parts: &[Value],
    index: usize,
    frame: &str,
    field: &str,
) -> Result<String, WireError> {
    parts
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| missing(frame, field))
}

fn missing(frame: &str, field: &str) -> WireError {
    WireError::InvalidMessage(format!("{} frame missing {}", frame, field))
}
