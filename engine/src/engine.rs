use std::collections::HashMap;

use tokio::sync::mpsc::{Receiver, Sender};
use tracing::{info, warn};

use crate::arena::{Arena, Handle};
use crate::dev::{CycleEvent, Device, DeviceParams};
use crate::hw::Loopback;
use crate::message::{Action, Event};
use crate::slot::Slot;

/// The single control task. Owns every device and slot; all mixing,
/// conversion and state transitions run synchronously inside one
/// message dispatch, so nothing here needs a lock. Hardware readiness
/// and client data both arrive as messages and take effect at message
/// boundaries, never mid-mix.
pub struct Engine {
    rx: Receiver<Action>,
    clients: Vec<Sender<Event>>,
    devices: Arena<Device>,
    slots: Arena<Slot>,
    slot_dev: HashMap<Handle, Handle>,
}

impl Engine {
    pub fn new(rx: Receiver<Action>) -> Self {
        Self {
            rx,
            clients: vec![],
            devices: Arena::new(),
            slots: Arena::new(),
            slot_dev: HashMap::new(),
        }
    }

    pub async fn work(&mut self) {
        while let Some(action) = self.rx.recv().await {
            if !self.dispatch(action).await {
                break;
            }
        }
        let mut out = vec![];
        for h in self.devices.handles() {
            if let Some(dev) = self.devices.get_mut(h) {
                dev.shutdown(&mut self.slots, &mut out);
            }
        }
        info!("engine stopped");
    }

    async fn broadcast(&mut self, event: Event) {
        for tx in &self.clients {
            let _ = tx.send(event.clone()).await;
        }
    }

    async fn reject(&mut self, msg: String) {
        warn!("{msg}");
        self.broadcast(Event::Error(msg)).await;
    }

    /// Translate one device pass's outcome into client notifications,
    /// retiring whatever the device gave up on.
    async fn flush(&mut self, dev: Handle, out: Vec<CycleEvent>) {
        for ev in out {
            match ev {
                CycleEvent::Attached(slot) => {
                    self.broadcast(Event::SlotRunning(slot)).await;
                }
                CycleEvent::Credit { slot, bytes, delta } => {
                    self.broadcast(Event::SlotCredit { slot, bytes, delta }).await;
                }
                CycleEvent::Eof(slot) => {
                    self.broadcast(Event::SlotEof(slot)).await;
                }
                CycleEvent::Gone { slot, reason } => {
                    self.slots.remove(slot);
                    self.slot_dev.remove(&slot);
                    self.broadcast(Event::SlotGone { slot, reason }).await;
                }
                CycleEvent::Midi(bytes) => {
                    self.broadcast(Event::Midi { dev, bytes }).await;
                }
            }
        }
    }

    fn slot_device(&self, slot: Handle) -> Option<Handle> {
        self.slot_dev.get(&slot).copied().filter(|&d| self.devices.contains(d))
    }

    /// Drop a slot that broke protocol or asked to leave.
    async fn remove_slot(&mut self, slot: Handle, reason: String) {
        if let Some(dev) = self.slot_device(slot) {
            if let Some(dev) = self.devices.get_mut(dev) {
                dev.unbind(slot);
            }
        }
        self.slots.remove(slot);
        self.slot_dev.remove(&slot);
        self.broadcast(Event::SlotGone { slot, reason }).await;
    }

    async fn dispatch(&mut self, action: Action) -> bool {
        match action {
            Action::Quit => return false,
            Action::Subscribe(tx) => {
                self.clients.push(tx);
            }
            Action::OpenDevice(params) => {
                let frame = params.enc.frame_size(params.pchan.max(params.rchan));
                let latency = params.bufsz as usize;
                match Device::open(params, Box::new(Loopback::new(frame, latency))) {
                    Ok(dev) => {
                        let h = self.devices.insert(dev);
                        self.broadcast(Event::DeviceOpen { dev: h }).await;
                    }
                    Err(e) => self.reject(e).await,
                }
            }
            Action::CloseDevice(h) => {
                let Some(mut dev) = self.devices.remove(h) else {
                    self.reject(format!("{h:?}: no such device")).await;
                    return true;
                };
                let mut out = vec![];
                dev.shutdown(&mut self.slots, &mut out);
                self.slot_dev.retain(|_, &mut d| d != h);
                self.flush(h, out).await;
                self.broadcast(Event::DeviceGone {
                    dev: h,
                    reason: "closed".to_string(),
                })
                .await;
            }
            Action::AttachSlot { dev, params } => {
                let Some(device) = self.devices.get_mut(dev) else {
                    self.reject(format!("{dev:?}: no such device")).await;
                    return true;
                };
                match Slot::new(params, &device.geometry()) {
                    Ok(slot) => {
                        let h = self.slots.insert(slot);
                        device.bind(h);
                        self.slot_dev.insert(h, dev);
                        self.broadcast(Event::SlotAttached { slot: h }).await;
                    }
                    Err(e) => self.reject(e).await,
                }
            }
            Action::SlotStart(h) => {
                let Some(dev) = self.slot_device(h) else {
                    self.reject(format!("{h:?}: no such slot")).await;
                    return true;
                };
                let geo = self.devices.get(dev).map(|d| d.geometry());
                let Some(slot) = self.slots.get_mut(h) else {
                    self.reject(format!("{h:?}: no such slot")).await;
                    return true;
                };
                match geo.ok_or_else(|| "device lost".to_string()).and_then(|g| slot.start(&g)) {
                    Ok(()) => {
                        let credit = slot.write_credit();
                        self.broadcast(Event::SlotCredit {
                            slot: h,
                            bytes: credit,
                            delta: 0,
                        })
                        .await;
                        self.run_control(dev).await;
                    }
                    Err(e) => self.reject(e).await,
                }
            }
            Action::SlotStop(h) => {
                let Some(slot) = self.slots.get_mut(h) else {
                    self.reject(format!("{h:?}: no such slot")).await;
                    return true;
                };
                if slot.request_stop() {
                    if let Some(dev) = self.slot_device(h) {
                        if let Some(dev) = self.devices.get_mut(dev) {
                            dev.unbind(h);
                        }
                    }
                    self.broadcast(Event::SlotEof(h)).await;
                }
            }
            Action::SlotData { slot: h, bytes } => {
                let Some(slot) = self.slots.get_mut(h) else {
                    self.reject(format!("{h:?}: no such slot")).await;
                    return true;
                };
                match slot.write_data(&bytes) {
                    Ok(()) => {
                        if let Some(dev) = self.slot_device(h) {
                            self.run_control(dev).await;
                        }
                    }
                    // exceeding the credit corrupts nothing: the
                    // connection just ends here
                    Err(e) => self.remove_slot(h, e).await,
                }
            }
            Action::SlotAck { slot: h, bytes } => {
                if let Some(slot) = self.slots.get_mut(h) {
                    slot.ack(bytes);
                }
            }
            Action::SlotVol { slot: h, vol } => {
                if let Some(slot) = self.slots.get_mut(h) {
                    slot.set_vol(vol);
                } else {
                    self.reject(format!("{h:?}: no such slot")).await;
                }
            }
            Action::SlotExit(h) => {
                self.remove_slot(h, "exit".to_string()).await;
            }
            Action::SetMaster { dev, vol } => {
                if let Some(device) = self.devices.get_mut(dev) {
                    device.set_master(vol);
                } else {
                    self.reject(format!("{dev:?}: no such device")).await;
                }
            }
            Action::DeviceCycle(h) => {
                let Some(device) = self.devices.get_mut(h) else {
                    // stale timer tick after a close; not an error
                    return true;
                };
                let mut out = vec![];
                let result = device.cycle(&mut self.slots, &mut out);
                match result {
                    Ok(()) => {
                        // demux finished; only now do recorded bytes
                        // become visible to clients
                        let mut recs = vec![];
                        for &sh in device.active_slots() {
                            if let Some(slot) = self.slots.get_mut(sh) {
                                let bytes = slot.read_data();
                                if !bytes.is_empty() {
                                    recs.push((sh, bytes));
                                }
                            }
                        }
                        device.control(&mut self.slots, &mut out);
                        self.flush(h, out).await;
                        for (sh, bytes) in recs {
                            self.broadcast(Event::SlotData { slot: sh, bytes }).await;
                        }
                    }
                    Err(e) => {
                        warn!("{e}");
                        if let Some(mut device) = self.devices.remove(h) {
                            device.shutdown(&mut self.slots, &mut out);
                        }
                        self.slot_dev.retain(|_, &mut d| d != h);
                        self.flush(h, out).await;
                        self.broadcast(Event::DeviceGone { dev: h, reason: e }).await;
                    }
                }
            }
            Action::Midi { dev, bytes } => {
                let Some(device) = self.devices.get_mut(dev) else {
                    self.reject(format!("{dev:?}: no such device")).await;
                    return true;
                };
                let mut out = vec![];
                device.midi_in(&bytes, &mut self.slots, &mut out);
                self.flush(dev, out).await;
            }
        }
        true
    }

    async fn run_control(&mut self, dev: Handle) {
        let Some(device) = self.devices.get_mut(dev) else {
            return;
        };
        let mut out = vec![];
        device.control(&mut self.slots, &mut out);
        self.flush(dev, out).await;
    }
}
