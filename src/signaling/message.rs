//! Сообщения сигнального канала и их JSON-представление
//! `{ "type": ..., "data": ..., "from": ... }`.

use crate::error::SignalingError;
use crate::peer::types::{IceCandidate, SdpType, SessionDescription};
use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    Ready,
    Leave,
    LocationInfo,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
            SignalKind::Ready => "ready",
            SignalKind::Leave => "leave",
            SignalKind::LocationInfo => "location-info",
        }
    }

    pub fn parse(tag: &str) -> Result<Self, SignalingError> {
        match tag {
            "offer" => Ok(SignalKind::Offer),
            "answer" => Ok(SignalKind::Answer),
            "ice-candidate" => Ok(SignalKind::IceCandidate),
            "ready" => Ok(SignalKind::Ready),
            "leave" => Ok(SignalKind::Leave),
            "location-info" => Ok(SignalKind::LocationInfo),
            other => Err(SignalingError::UnknownType(other.to_owned())),
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    Ready,
    Leave,
    /// Непрозрачные данные о местоположении, их читает только UI
    LocationInfo(Value),
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Offer(_) => SignalKind::Offer,
            SignalPayload::Answer(_) => SignalKind::Answer,
            SignalPayload::IceCandidate(_) => SignalKind::IceCandidate,
            SignalPayload::Ready => SignalKind::Ready,
            SignalPayload::Leave => SignalKind::Leave,
            SignalPayload::LocationInfo(_) => SignalKind::LocationInfo,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalMessage {
    pub from: String,
    pub payload: SignalPayload,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    from: String,
}

fn description(data: Value, expected: SdpType) -> Result<SessionDescription, SignalingError> {
    let desc: SessionDescription = serde_json::from_value(data)?;
    if desc.sdp_type != expected {
        return Err(SignalingError::Decode(serde_json::Error::custom(format!(
            "description type {:?} does not match message type {:?}",
            desc.sdp_type, expected
        ))));
    }
    Ok(desc)
}

impl SignalMessage {
    pub fn new(from: impl Into<String>, payload: SignalPayload) -> Self {
        Self {
            from: from.into(),
            payload,
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.payload.kind()
    }

    pub fn to_value(&self) -> Result<Value, SignalingError> {
        let data = match &self.payload {
            SignalPayload::Offer(desc) | SignalPayload::Answer(desc) => serde_json::to_value(desc)?,
            SignalPayload::IceCandidate(candidate) => serde_json::to_value(candidate)?,
            SignalPayload::Ready | SignalPayload::Leave => Value::Null,
            SignalPayload::LocationInfo(info) => info.clone(),
        };
        Ok(serde_json::to_value(WireMessage {
            kind: self.kind().as_str().to_owned(),
            data,
            from: self.from.clone(),
        })?)
    }

    pub fn to_json(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(&self.to_value()?)?)
    }

    pub fn from_value(value: Value) -> Result<Self, SignalingError> {
        let wire: WireMessage = serde_json::from_value(value)?;
        let payload = match SignalKind::parse(&wire.kind)? {
            SignalKind::Offer => SignalPayload::Offer(description(wire.data, SdpType::Offer)?),
            SignalKind::Answer => SignalPayload::Answer(description(wire.data, SdpType::Answer)?),
            SignalKind::IceCandidate => {
                SignalPayload::IceCandidate(serde_json::from_value(wire.data)?)
            }
            SignalKind::Ready => SignalPayload::Ready,
            SignalKind::Leave => SignalPayload::Leave,
            SignalKind::LocationInfo => SignalPayload::LocationInfo(wire.data),
        };
        Ok(Self {
            from: wire.from,
            payload,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, SignalingError> {
        Self::from_value(serde_json::from_str(text)?)
    }
}
