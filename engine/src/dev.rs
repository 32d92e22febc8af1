use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::arena::{Arena, Handle};
use crate::chanmap::GAIN_SHIFT;
use crate::fmt::{Encoding, SampleCodec};
use crate::hw::HwDevice;
use crate::slot::{CycleResult, DevGeometry, Slot, SlotMode, SlotState, VOL_MAX};
use crate::transport::{Fps, MmcCommand, TransportSync};

/// Hardware geometry and encoding, fixed while the device is open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceParams {
    pub name: String,
    pub rate: u32,
    /// frames per cycle
    pub round: u32,
    /// hardware buffer, a multiple of `round`
    pub bufsz: u32,
    pub pchan: usize,
    pub rchan: usize,
    pub enc: Encoding,
    /// master attenuation, 0..=127
    pub master: u32,
    /// MMC device id this device answers to
    pub mmc_dev: u8,
}

impl Default for DeviceParams {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            rate: 48000,
            round: 480,
            bufsz: 1920,
            pchan: 2,
            rchan: 2,
            enc: Encoding::s16_ne(),
            master: VOL_MAX,
            mmc_dev: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevState {
    /// Unopened; parameters only.
    Cfg,
    /// Opened, hardware idle.
    Init,
    /// Hardware transferring.
    Run,
}

/// What one control/cycle pass wants the engine to tell clients.
#[derive(Debug)]
pub enum CycleEvent {
    Attached(Handle),
    Credit {
        slot: Handle,
        bytes: usize,
        delta: i64,
    },
    Eof(Handle),
    Gone {
        slot: Handle,
        reason: String,
    },
    Midi(Vec<u8>),
}

/// One hardware device: owns the native mix/record buffers, runs the
/// per-period cycle, and hosts the transport synchronizer. Slots are
/// stored in the engine's arena; the device keeps their handles in a
/// stable order.
pub struct Device {
    pub name: String,
    state: DevState,
    rate: u32,
    round: u32,
    bufsz: u32,
    pchan: usize,
    rchan: usize,
    codec: SampleCodec,
    hw: Box<dyn HwDevice>,
    /// bound but not yet running
    pending: Vec<Handle>,
    /// attached, mixed every cycle, stable order
    active: Vec<Handle>,
    mix_buf: Vec<i32>,
    play_bytes: Vec<u8>,
    rec_buf: Vec<i32>,
    rec_bytes: Vec<u8>,
    /// device clock, in frames since open
    delta: i64,
    master: u32,
    master_gain: i64,
    transport: Option<TransportSync>,
    mmc_start_pending: bool,
}

impl Device {
    pub fn open(params: DeviceParams, hw: Box<dyn HwDevice>) -> Result<Self, String> {
        let enc = Encoding::new(
            params.enc.bits,
            params.enc.bps,
            params.enc.sig,
            params.enc.le,
            params.enc.msb,
        )?;
        if params.rate == 0 || params.round == 0 {
            return Err(format!("{}: bad rate/round", params.name));
        }
        if params.pchan == 0 && params.rchan == 0 {
            return Err(format!("{}: no channels at all", params.name));
        }
        if params.master > VOL_MAX {
            return Err(format!("{}: master volume out of range", params.name));
        }
        let bufsz = params.bufsz.max(params.round).next_multiple_of(params.round);
        let transport = match Fps::for_rate(params.rate) {
            Some(fps) => Some(TransportSync::new(params.rate, fps, params.mmc_dev)?),
            None => {
                warn!(name = %params.name, rate = params.rate, "no usable MTC rate");
                None
            }
        };
        let round = params.round as usize;
        info!(name = %params.name, rate = params.rate, round = params.round, "device open");
        Ok(Self {
            name: params.name,
            state: DevState::Init,
            rate: params.rate,
            round: params.round,
            bufsz,
            pchan: params.pchan,
            rchan: params.rchan,
            codec: SampleCodec::new(&enc),
            hw,
            pending: vec![],
            active: vec![],
            mix_buf: vec![0; round * params.pchan],
            play_bytes: vec![0; round * params.pchan * enc.bps as usize],
            rec_buf: vec![0; round * params.rchan],
            rec_bytes: vec![0; round * params.rchan * enc.bps as usize],
            delta: 0,
            master: params.master,
            master_gain: master_gain(params.master),
            transport,
            mmc_start_pending: false,
        })
    }

    pub fn geometry(&self) -> DevGeometry {
        DevGeometry {
            rate: self.rate,
            round: self.round,
            bufsz: self.bufsz,
            pchan: self.pchan,
            rchan: self.rchan,
        }
    }

    pub fn state(&self) -> DevState {
        self.state
    }

    pub fn position(&self) -> i64 {
        self.delta
    }

    pub fn master(&self) -> u32 {
        self.master
    }

    pub fn set_master(&mut self, vol: u32) {
        self.master = vol.min(VOL_MAX);
        self.master_gain = master_gain(self.master);
    }

    /// Handles of every slot bound to this device.
    pub fn slots(&self) -> Vec<Handle> {
        let mut all = self.pending.clone();
        all.extend(&self.active);
        all
    }

    pub fn active_slots(&self) -> &[Handle] {
        &self.active
    }

    pub fn bind(&mut self, slot: Handle) {
        if !self.pending.contains(&slot) && !self.active.contains(&slot) {
            self.pending.push(slot);
        }
    }

    /// Forget a slot entirely (client exit or fatal error).
    pub fn unbind(&mut self, slot: Handle) {
        self.pending.retain(|&h| h != slot);
        self.active.retain(|&h| h != slot);
    }

    /// Promote slots along START -> READY -> RUN. Slots tagged for MMC
    /// wait until the transport starts and every tagged slot is ready,
    /// then attach together in the same pass.
    pub fn control(&mut self, slots: &mut Arena<Slot>, out: &mut Vec<CycleEvent>) {
        let mut attach = vec![];
        for &h in &self.pending {
            let Some(slot) = slots.get_mut(h) else {
                continue;
            };
            if slot.check_ready() && !slot.mmc {
                attach.push(h);
            }
        }
        if self.mmc_start_pending {
            let tagged: Vec<Handle> = self
                .pending
                .iter()
                .copied()
                .filter(|&h| slots.get(h).is_some_and(|s| s.mmc))
                .collect();
            let all_ready = !tagged.is_empty()
                && tagged
                    .iter()
                    .all(|&h| slots.get_mut(h).is_some_and(|s| s.check_ready()));
            if all_ready {
                attach.extend(tagged);
                self.mmc_start_pending = false;
                if let Some(t) = self.transport.as_mut() {
                    let mut midi = vec![];
                    t.start(&mut midi);
                    out.push(CycleEvent::Midi(midi));
                }
            }
        }
        for h in attach {
            if let Some(slot) = slots.get_mut(h) {
                slot.attach();
                self.pending.retain(|&p| p != h);
                self.active.push(h);
                out.push(CycleEvent::Attached(h));
            }
        }
        if !self.active.is_empty() && self.state == DevState::Init {
            if let Err(e) = self.hw.start() {
                warn!(name = %self.name, "hardware start failed: {e}");
            } else {
                self.state = DevState::Run;
                debug!(name = %self.name, "hardware running");
            }
        }
    }

    /// MMC sysex from the control plane.
    pub fn midi_in(&mut self, bytes: &[u8], slots: &mut Arena<Slot>, out: &mut Vec<CycleEvent>) {
        let Some(cmd) = self.transport.as_ref().and_then(|t| t.parse_mmc(bytes)) else {
            return;
        };
        match cmd {
            MmcCommand::Start => {
                debug!(name = %self.name, "transport start requested");
                self.mmc_start_pending = true;
            }
            MmcCommand::Stop => {
                debug!(name = %self.name, "transport stop");
                self.mmc_start_pending = false;
                if let Some(t) = self.transport.as_mut() {
                    t.stop();
                }
                self.stop_tagged(slots, out);
            }
            MmcCommand::Locate { hr, min, sec, fr } => {
                // relocate is a stop plus a deferred restart at the new
                // origin, once the tagged slots are ready again
                let was_running = self.transport.as_ref().is_some_and(|t| t.running());
                if let Some(t) = self.transport.as_mut() {
                    t.stop();
                    t.set_position(hr, min, sec, fr);
                }
                self.stop_tagged(slots, out);
                self.mmc_start_pending = was_running || self.mmc_start_pending;
            }
        }
        self.control(slots, out);
    }

    fn stop_tagged(&mut self, slots: &mut Arena<Slot>, out: &mut Vec<CycleEvent>) {
        for h in self.slots() {
            let Some(slot) = slots.get_mut(h) else {
                continue;
            };
            if !slot.mmc || slot.state == SlotState::Init {
                continue;
            }
            // active play slots drain first; anything never attached
            // has nothing audible to lose
            let detach_now = if self.active.contains(&h) {
                slot.request_stop()
            } else {
                slot.finish();
                true
            };
            if detach_now {
                self.unbind(h);
                out.push(CycleEvent::Eof(h));
            }
        }
    }

    /// One device period: mix every play stream, hand the block to the
    /// hardware, demux the recorded block, advance clocks, retire
    /// whatever finished. Invoked from the reactor's completion
    /// notification. A hardware error is fatal for the whole device.
    pub fn cycle(&mut self, slots: &mut Arena<Slot>, out: &mut Vec<CycleEvent>) -> Result<(), String> {
        if self.state != DevState::Run {
            return Ok(());
        }
        let geo = self.geometry();
        let round = self.round as usize;
        let mut dead = vec![];

        self.mix_buf.fill(0);
        for &h in &self.active {
            let Some(slot) = slots.get_mut(h) else {
                continue;
            };
            if slot.mode.plays()
                && slot.run_play(&mut self.mix_buf, &geo) == CycleResult::Fatal
            {
                dead.push(h);
            }
        }
        if self.master_gain < (1 << GAIN_SHIFT) {
            for s in self.mix_buf.iter_mut() {
                *s = ((*s as i64 * self.master_gain) >> GAIN_SHIFT) as i32;
            }
        }

        if self.pchan > 0 {
            self.codec.encode(&self.mix_buf, &mut self.play_bytes);
            self.hw
                .write_block(&self.play_bytes)
                .map_err(|e| format!("{}: write failed: {e}", self.name))?;
        }
        if self.rchan > 0 {
            self.hw
                .read_block(&mut self.rec_bytes)
                .map_err(|e| format!("{}: read failed: {e}", self.name))?;
            self.codec.decode(&self.rec_bytes, &mut self.rec_buf);
        }

        for &h in &self.active {
            let Some(slot) = slots.get_mut(h) else {
                continue;
            };
            if !slot.mode.records() || dead.contains(&h) {
                continue;
            }
            let block = if slot.mode == SlotMode::Monitor {
                &self.mix_buf
            } else {
                &self.rec_buf
            };
            if slot.run_rec(block, &geo) == CycleResult::Fatal {
                dead.push(h);
            }
        }

        self.delta += round as i64;
        if let Some(t) = self.transport.as_mut() {
            let mut midi = vec![];
            t.advance(self.round, &mut midi);
            if !midi.is_empty() {
                out.push(CycleEvent::Midi(midi));
            }
        }

        for &h in &self.active {
            let Some(slot) = slots.get_mut(h) else {
                continue;
            };
            slot.advance_clock(&geo);
            let (bytes, delta) = slot.take_credit();
            if bytes > 0 || delta > 0 {
                out.push(CycleEvent::Credit {
                    slot: h,
                    bytes,
                    delta,
                });
            }
        }

        let drained: Vec<Handle> = self
            .active
            .iter()
            .copied()
            .filter(|&h| slots.get(h).is_some_and(|s| s.drained()))
            .collect();
        for h in drained {
            if let Some(slot) = slots.get_mut(h) {
                slot.finish();
            }
            self.unbind(h);
            out.push(CycleEvent::Eof(h));
        }
        for h in dead {
            self.unbind(h);
            out.push(CycleEvent::Gone {
                slot: h,
                reason: "xrun".to_string(),
            });
        }

        if self.active.is_empty() && self.state == DevState::Run {
            if let Err(e) = self.hw.stop() {
                warn!(name = %self.name, "hardware stop failed: {e}");
            }
            self.state = DevState::Init;
            debug!(name = %self.name, "hardware idle");
        }
        Ok(())
    }

    /// Hardware failure teardown: force every bound slot out and drop
    /// back to CFG. The caller forgets the device afterwards.
    pub fn shutdown(&mut self, slots: &mut Arena<Slot>, out: &mut Vec<CycleEvent>) {
        for h in self.slots() {
            if let Some(slot) = slots.get_mut(h) {
                slot.finish();
            }
            out.push(CycleEvent::Gone {
                slot: h,
                reason: "device gone".to_string(),
            });
        }
        self.pending.clear();
        self.active.clear();
        let _ = self.hw.stop();
        self.state = DevState::Cfg;
        info!(name = %self.name, "device closed");
    }
}

fn master_gain(vol: u32) -> i64 {
    (vol.min(VOL_MAX) as i64 * (1 << GAIN_SHIFT)) / VOL_MAX as i64
}
