// MIT License - Copyright (c) 2026 Peter Wright
// Engine events and command channel

use crate::command::BusCommand;
use crate::devices::DeviceKind;
use crate::devices::virtual_device::VirtualKind;

/// Everything the bus engine reports to the automation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A value changed and must be published on `topic`.
    Publish { topic: String, payload: String },
    /// First frame from a new instance id while discovery is open.
    ///
    /// `last_query` is the most recent query frame seen on the bus; light
    /// banks need it to number their switches.
    DeviceFound {
        device: DeviceKind,
        id: u8,
        frame: Vec<u8>,
        last_query: Vec<u8>,
    },
    /// A virtual device must (re)announce its entities.
    VirtualDeviceReady { device: VirtualKind },
    /// The discovery grace window closed.
    DiscoveryComplete,
}

/// Sender half used by the engine.
pub type EventSender = tokio::sync::mpsc::UnboundedSender<BusEvent>;

/// Receiver half consumed by the bridge.
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<BusEvent>;

/// Sender half used by the messaging side to hand commands to the engine.
pub type CommandSender = tokio::sync::mpsc::UnboundedSender<BusCommand>;

/// Receiver half drained by the engine once per bus turn.
pub type CommandReceiver = tokio::sync::mpsc::UnboundedReceiver<BusCommand>;

/// Create a new event channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

/// Create a new command channel.
pub fn command_channel() -> (CommandSender, CommandReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}
