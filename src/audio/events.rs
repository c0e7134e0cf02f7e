// Endpoint configuration change notifications, fanned out to registered
// observers. Fire-and-forget payloads; observers that fall behind only cost
// memory in their own channel.

use serde::{Deserialize, Serialize};

use crate::audio::types::{EndpointId, OutputDescriptor, StreamType};

/// Configuration change event. Stream re-routing carries its stream type as
/// payload and is a first-class variant; it shares nothing with the closed
/// path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IoConfigEvent {
    OutputOpened(OutputDescriptor),
    OutputClosed,
    OutputConfigChanged(OutputDescriptor),
    StreamConfigChanged(StreamType),
    InputOpened(OutputDescriptor),
    InputClosed,
    InputConfigChanged(OutputDescriptor),
}

/// Event as delivered to an observer, tagged with the endpoint it concerns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoNotification {
    pub endpoint: EndpointId,
    pub event: IoConfigEvent,
}

/// Event kinds queued inside a thread before the descriptor payload is
/// attached at dispatch time (the descriptor must reflect the parameters in
/// effect when the event leaves the thread, not when it was queued).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingEvent {
    OutputOpened,
    OutputClosed,
    OutputConfigChanged,
    StreamConfigChanged(StreamType),
    InputOpened,
    InputClosed,
    InputConfigChanged,
}
