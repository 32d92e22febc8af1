use tokio::sync::mpsc::Sender;

use crate::arena::Handle;
use crate::dev::DeviceParams;
use crate::slot::SlotParams;

/// Requests into the engine: everything a client transport, the
/// hardware reactor, or the daemon itself may ask for. All of them are
/// processed in arrival order on the engine task.
#[derive(Debug, Clone)]
pub enum Action {
    Quit,
    /// Register a notification channel.
    Subscribe(Sender<Event>),
    OpenDevice(DeviceParams),
    CloseDevice(Handle),
    AttachSlot {
        dev: Handle,
        params: SlotParams,
    },
    SlotStart(Handle),
    SlotStop(Handle),
    /// Client audio bytes for a play stream; must fit the write credit.
    SlotData {
        slot: Handle,
        bytes: Vec<u8>,
    },
    /// Client consumed recorded bytes; widens its read window.
    SlotAck {
        slot: Handle,
        bytes: usize,
    },
    SlotVol {
        slot: Handle,
        vol: u32,
    },
    SlotExit(Handle),
    SetMaster {
        dev: Handle,
        vol: u32,
    },
    /// Hardware period completed; run one device cycle.
    DeviceCycle(Handle),
    /// Raw MIDI (MMC sysex) for a device's transport.
    Midi {
        dev: Handle,
        bytes: Vec<u8>,
    },
}

/// Notifications out of the engine, broadcast to every subscriber.
#[derive(Debug, Clone)]
pub enum Event {
    DeviceOpen {
        dev: Handle,
    },
    DeviceGone {
        dev: Handle,
        reason: String,
    },
    SlotAttached {
        slot: Handle,
    },
    /// The slot joined the device's active list.
    SlotRunning(Handle),
    /// Write credit grant plus the stream clock advance.
    SlotCredit {
        slot: Handle,
        bytes: usize,
        delta: i64,
    },
    /// Recorded bytes for the client, within its read window.
    SlotData {
        slot: Handle,
        bytes: Vec<u8>,
    },
    /// Play side fully drained after a stop.
    SlotEof(Handle),
    SlotGone {
        slot: Handle,
        reason: String,
    },
    /// Timecode/transport bytes to put on the MIDI wire.
    Midi {
        dev: Handle,
        bytes: Vec<u8>,
    },
    /// A request that could not be honored.
    Error(String),
}
