use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chanmap::{ChannelMapper, ChannelRange, GAIN_UNIT};
use crate::fmt::{Encoding, SampleCodec};
use crate::resamp::Resampler;
use crate::ring::RingBuffer;

pub const VOL_MAX: u32 = 127;

/// What to do when a slot misses a cycle (play underrun or record
/// overrun).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XrunPolicy {
    /// Leave the shortfall; the stream simply lags. Position accuracy is
    /// lost silently.
    Ignore,
    /// Insert silence / drop backlog rounded to a device block boundary
    /// so alignment with the device clock is restored exactly.
    #[default]
    Sync,
    /// Fatal for this slot: the owning connection is hung up.
    Error,
}

/// The closed set of stream shapes a client can attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotMode {
    Play,
    Rec,
    Duplex,
    /// Passive reader of the device's own mix.
    Monitor,
}

impl SlotMode {
    pub fn plays(&self) -> bool {
        matches!(self, SlotMode::Play | SlotMode::Duplex)
    }

    pub fn records(&self) -> bool {
        matches!(self, SlotMode::Rec | SlotMode::Duplex | SlotMode::Monitor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Attached, nothing allocated yet.
    Init,
    /// Conversion chain allocated, play buffer filling.
    Start,
    /// Primed; waiting to join the device (possibly for an MMC group).
    Ready,
    /// On the device's active list.
    Run,
    /// Stopping; the play side drains what is already buffered.
    Stop,
}

/// Parameters negotiated before the stream starts. Set once; restarting
/// a stream rebuilds everything from these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotParams {
    pub name: String,
    pub mode: SlotMode,
    pub enc: Encoding,
    pub rate: u32,
    /// Device channels this stream covers.
    pub chan: ChannelRange,
    /// Spread/average the stream over the whole device range.
    pub dup: bool,
    /// Requested buffer depth in slot frames.
    pub appbufsz: u32,
    pub xrun: XrunPolicy,
    /// Participates in MMC group start/stop.
    pub mmc: bool,
    pub vol: u32,
}

/// Device geometry a slot converts against.
#[derive(Debug, Clone, Copy)]
pub struct DevGeometry {
    pub rate: u32,
    pub round: u32,
    pub bufsz: u32,
    pub pchan: usize,
    pub rchan: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CycleResult {
    Ran,
    /// Underrun/overrun absorbed per policy.
    Xrun,
    /// ERROR policy fired; remove the slot.
    Fatal,
}

struct PlayChain {
    ring: RingBuffer,
    resamp: Option<Resampler>,
    maps: Vec<ChannelMapper>,
    /// join factor the mix gain is divided by
    joins: usize,
    dec_buf: Vec<i32>,
    res_buf: Vec<i32>,
}

struct RecChain {
    ring: RingBuffer,
    resamp: Option<Resampler>,
    maps: Vec<ChannelMapper>,
    map_gain: i32,
    map_buf: Vec<i32>,
    res_buf: Vec<i32>,
    enc_buf: Vec<u8>,
    /// silent blocks to inject before capture reflects the device cycle
    prime: u32,
    /// silent blocks owed by play-side SYNC corrections (duplex lockstep)
    silence: u32,
}

pub struct Slot {
    pub name: String,
    pub mode: SlotMode,
    pub state: SlotState,
    pub mmc: bool,
    pub xrun: XrunPolicy,
    enc: Encoding,
    codec: SampleCodec,
    rate: u32,
    chan: ChannelRange,
    dup: bool,
    /// slot-rate frames per device cycle, nominal
    round: u32,
    appbufsz: u32,
    vol: u32,
    gain: i32,
    play: Option<PlayChain>,
    rec: Option<RecChain>,
    /// device cycles to process virtually before real I/O resumes
    skip: u32,
    /// slot frames advanced since the last client notification
    delta: i64,
    delta_rem: i64,
    /// flow-control credits, in bytes
    wmax: usize,
    rmax: usize,
    /// bytes freed for the client since the last credit grant
    pending_credit: usize,
}

impl Slot {
    pub fn new(params: SlotParams, geo: &DevGeometry) -> Result<Self, String> {
        let enc = Encoding::new(
            params.enc.bits,
            params.enc.bps,
            params.enc.sig,
            params.enc.le,
            params.enc.msb,
        )?;
        if params.rate == 0 {
            return Err(format!("{}: zero sample rate", params.name));
        }
        let pside = params.mode.plays() || params.mode == SlotMode::Monitor;
        if pside && params.chan.min >= geo.pchan {
            return Err(format!("{}: channels outside playback range", params.name));
        }
        if matches!(params.mode, SlotMode::Rec | SlotMode::Duplex) && params.chan.min >= geo.rchan {
            return Err(format!("{}: channels outside capture range", params.name));
        }
        if params.vol > VOL_MAX {
            return Err(format!("{}: volume out of range", params.vol));
        }
        let round = (geo.round as u64 * params.rate as u64).div_ceil(geo.rate as u64) as u32;
        let appbufsz = params.appbufsz.max(round).next_multiple_of(round);
        Ok(Self {
            name: params.name,
            mode: params.mode,
            state: SlotState::Init,
            mmc: params.mmc,
            xrun: params.xrun,
            codec: SampleCodec::new(&enc),
            enc,
            rate: params.rate,
            chan: params.chan,
            dup: params.dup,
            round,
            appbufsz,
            vol: params.vol,
            gain: vol_gain(params.vol),
            play: None,
            rec: None,
            skip: 0,
            delta: 0,
            delta_rem: 0,
            wmax: 0,
            rmax: 0,
            pending_credit: 0,
        })
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn appbufsz(&self) -> u32 {
        self.appbufsz
    }

    pub fn vol(&self) -> u32 {
        self.vol
    }

    pub fn set_vol(&mut self, vol: u32) {
        self.vol = vol.min(VOL_MAX);
        self.gain = vol_gain(self.vol);
    }

    pub fn write_credit(&self) -> usize {
        self.wmax
    }

    fn nch(&self) -> usize {
        self.chan.count()
    }

    fn frame_size(&self) -> usize {
        self.enc.frame_size(self.nch())
    }

    /// Client "start": allocate buffers and the conversion chain sized
    /// from the negotiated parameters.
    pub fn start(&mut self, geo: &DevGeometry) -> Result<(), String> {
        if self.state != SlotState::Init {
            return Err(format!("{}: already started", self.name));
        }
        let nch = self.nch();
        let fsize = self.frame_size();
        let out_bound = self.round as usize + 2;
        if self.mode.plays() {
            let (maps, joins) = mappers(&self.chan, self.dup, geo.pchan, Dir::Play);
            self.play = Some(PlayChain {
                ring: RingBuffer::new(self.appbufsz as usize, fsize),
                dec_buf: vec![0; out_bound * nch],
                res_buf: vec![0; geo.round as usize * nch],
                resamp: self.make_resamp(self.rate, geo.rate, nch)?,
                maps,
                joins,
            });
            self.wmax = self.appbufsz as usize * fsize;
        }
        if self.mode.records() {
            let src = if self.mode == SlotMode::Monitor {
                geo.pchan
            } else {
                geo.rchan
            };
            let (maps, joins) = mappers(&self.chan, self.dup, src, Dir::Rec);
            self.rec = Some(RecChain {
                ring: RingBuffer::new(self.appbufsz as usize, fsize),
                map_buf: vec![0; geo.round as usize * nch],
                res_buf: vec![0; out_bound * nch],
                enc_buf: vec![0; out_bound * fsize],
                resamp: self.make_resamp(geo.rate, self.rate, nch)?,
                maps,
                map_gain: (GAIN_UNIT as usize / joins) as i32,
                prime: if self.mode == SlotMode::Monitor {
                    geo.bufsz / geo.round
                } else {
                    0
                },
                silence: 0,
            });
            self.rmax = self.appbufsz as usize * fsize;
        }
        self.skip = 0;
        self.delta = 0;
        self.delta_rem = 0;
        self.pending_credit = 0;
        self.state = SlotState::Start;
        debug!(name = %self.name, round = self.round, "slot starting");
        Ok(())
    }

    fn make_resamp(&self, from: u32, to: u32, nch: usize) -> Result<Option<Resampler>, String> {
        if from == to {
            Ok(None)
        } else {
            Resampler::new(from as u64, to as u64, nch).map(Some)
        }
    }

    /// START -> READY once the play buffer is primed (immediately for
    /// pure readers).
    pub fn check_ready(&mut self) -> bool {
        match self.state {
            SlotState::Ready => true,
            SlotState::Start => {
                let primed = match &self.play {
                    Some(p) => p.ring.full(),
                    None => true,
                };
                if primed {
                    self.state = SlotState::Ready;
                }
                primed
            }
            _ => false,
        }
    }

    pub fn attach(&mut self) {
        debug_assert_eq!(self.state, SlotState::Ready);
        self.state = SlotState::Run;
        debug!(name = %self.name, "slot running");
    }

    /// Client "stop". Returns true when the slot detaches immediately
    /// (nothing to drain).
    pub fn request_stop(&mut self) -> bool {
        let drains = self.mode.plays()
            && matches!(
                self.state,
                SlotState::Start | SlotState::Ready | SlotState::Run
            )
            && self.play.as_ref().is_some_and(|p| !p.ring.empty());
        if drains {
            self.state = SlotState::Stop;
            false
        } else {
            self.finish();
            true
        }
    }

    /// Drained (or detached): free the conversion chain, back to INIT.
    pub fn finish(&mut self) {
        self.play = None;
        self.rec = None;
        self.state = SlotState::Init;
        debug!(name = %self.name, "slot finished");
    }

    pub fn drained(&self) -> bool {
        self.state == SlotState::Stop && self.play.as_ref().is_none_or(|p| p.ring.empty())
    }

    /// Client audio bytes, subject to the write credit. A client pushing
    /// more than it was granted is breaking protocol.
    pub fn write_data(&mut self, bytes: &[u8]) -> Result<(), String> {
        if bytes.len() > self.wmax {
            return Err(format!(
                "{}: {} bytes exceeds write credit {}",
                self.name,
                bytes.len(),
                self.wmax
            ));
        }
        let Some(play) = self.play.as_mut() else {
            return Err(format!("{}: not accepting data", self.name));
        };
        if bytes.len() % play.ring.frame_size() != 0 {
            return Err(format!("{}: misaligned data chunk", self.name));
        }
        let frames = bytes.len() / play.ring.frame_size();
        if frames > play.ring.avail() {
            return Err(format!("{}: buffer overflow", self.name));
        }
        play.ring.write(bytes);
        self.wmax -= bytes.len();
        Ok(())
    }

    /// Drain recorded bytes for the client, bounded by its read credit.
    pub fn read_data(&mut self) -> Vec<u8> {
        let Some(rec) = self.rec.as_mut() else {
            return vec![];
        };
        let fsize = rec.ring.frame_size();
        let frames = (self.rmax / fsize).min(rec.ring.used());
        let mut out = vec![0; frames * fsize];
        rec.ring.read(&mut out);
        self.rmax -= out.len();
        out
    }

    /// The client consumed `bytes` of recorded data; widen its window.
    pub fn ack(&mut self, bytes: usize) {
        if let Some(rec) = &self.rec {
            let cap = rec.ring.capacity() * rec.ring.frame_size();
            self.rmax = (self.rmax + bytes).min(cap);
        }
    }

    /// Write credit to grant plus the clock advance since the last call.
    pub fn take_credit(&mut self) -> (usize, i64) {
        let grant = self.pending_credit;
        self.wmax += grant;
        self.pending_credit = 0;
        let delta = self.delta;
        self.delta = 0;
        (grant, delta)
    }

    /// Mix one device block of this stream into `mix` (round * pchan
    /// native samples). Pending skips are drained first, without
    /// touching the mix.
    pub fn run_play(&mut self, mix: &mut [i32], geo: &DevGeometry) -> CycleResult {
        let gain = self.gain;
        let codec = self.codec;
        let nch = self.nch();
        let draining = self.state == SlotState::Stop;
        let Some(play) = self.play.as_mut() else {
            return CycleResult::Ran;
        };

        while self.skip > 0 {
            let need = resamp_need(&play.resamp, geo.round as usize);
            if play.ring.used() < need {
                break;
            }
            discard_block(play, need, nch, geo.round as usize);
            self.pending_credit += need * play.ring.frame_size();
            self.skip -= 1;
            if let Some(rec) = self.rec.as_mut() {
                rec.silence += 1;
            }
        }
        if self.skip > 0 {
            // still behind; this cycle stays virtual
            return CycleResult::Xrun;
        }

        let need = resamp_need(&play.resamp, geo.round as usize);
        if play.ring.used() < need {
            if draining {
                // drain the partial tail, the rest of the block is silence
                let have = play.ring.used();
                if have > 0 {
                    self.pending_credit += have * play.ring.frame_size();
                    mix_block(play, &codec, have, nch, gain, mix, geo);
                }
                return CycleResult::Ran;
            }
            return match self.xrun {
                XrunPolicy::Ignore => CycleResult::Xrun,
                XrunPolicy::Sync => {
                    warn!(name = %self.name, "play underrun, resyncing");
                    self.skip += 1;
                    if let Some(rec) = self.rec.as_mut() {
                        rec.silence += 1;
                    }
                    CycleResult::Xrun
                }
                XrunPolicy::Error => {
                    warn!(name = %self.name, "play underrun, dropping stream");
                    CycleResult::Fatal
                }
            };
        }

        self.pending_credit += need * play.ring.frame_size();
        mix_block(play, &codec, need, nch, gain, mix, geo);
        CycleResult::Ran
    }

    /// Demux one recorded device block (or the mix, for monitors) into
    /// this stream's buffer.
    pub fn run_rec(&mut self, block: &[i32], geo: &DevGeometry) -> CycleResult {
        let codec = self.codec;
        let nch = self.nch();
        let slot_round = self.round as usize;
        let Some(rec) = self.rec.as_mut() else {
            return CycleResult::Ran;
        };

        if rec.prime > 0 || rec.silence > 0 {
            // virtual block: the position advances without real capture
            if rec.prime > 0 {
                rec.prime -= 1;
            } else {
                rec.silence -= 1;
            }
            if rec.ring.avail() >= slot_round {
                let fsize = rec.ring.frame_size();
                codec.silence(&mut rec.enc_buf[..slot_round * fsize]);
                rec.ring.write(&rec.enc_buf[..slot_round * fsize]);
            }
            return CycleResult::Ran;
        }

        let frames = geo.round as usize;
        rec.map_buf[..frames * nch].fill(0);
        for map in &rec.maps {
            map.add(block, &mut rec.map_buf, rec.map_gain, frames);
        }

        let (out_frames, from_res) = match rec.resamp.as_mut() {
            Some(r) => (r.process(&rec.map_buf[..frames * nch], &mut rec.res_buf), true),
            None => (frames, false),
        };

        if rec.ring.avail() < out_frames {
            return match self.xrun {
                XrunPolicy::Ignore => CycleResult::Xrun,
                XrunPolicy::Sync => {
                    // drop the backlog a whole block at a time so the
                    // client resumes exactly on a block boundary
                    warn!(name = %self.name, "record overrun, dropping backlog");
                    let drop = out_frames.next_multiple_of(slot_round);
                    rec.ring.discard(drop.min(rec.ring.used()));
                    push_encoded(rec, &codec, out_frames, nch, from_res);
                    if self.mode == SlotMode::Duplex {
                        self.skip += 1;
                    }
                    CycleResult::Xrun
                }
                XrunPolicy::Error => {
                    warn!(name = %self.name, "record overrun, dropping stream");
                    CycleResult::Fatal
                }
            };
        }
        push_encoded(rec, &codec, out_frames, nch, from_res);
        CycleResult::Ran
    }

    /// Advance the stream's logical clock by one device cycle, scaling
    /// by the rate ratio and carrying the sub-cycle remainder.
    pub fn advance_clock(&mut self, geo: &DevGeometry) {
        self.delta_rem += geo.round as i64 * self.rate as i64;
        self.delta += self.delta_rem / geo.rate as i64;
        self.delta_rem %= geo.rate as i64;
    }
}

fn vol_gain(vol: u32) -> i32 {
    ((vol.min(VOL_MAX) as i64 * GAIN_UNIT as i64) / VOL_MAX as i64) as i32
}

fn resamp_need(resamp: &Option<Resampler>, out_frames: usize) -> usize {
    match resamp {
        Some(r) => r.input_for_output(out_frames),
        None => out_frames,
    }
}

/// Decode `need` frames out of the ring (following the wrap), resample,
/// and add the result into the device mix through every mapper pass.
fn mix_block(
    play: &mut PlayChain,
    codec: &SampleCodec,
    need: usize,
    nch: usize,
    gain: i32,
    mix: &mut [i32],
    geo: &DevGeometry,
) {
    let fsize = play.ring.frame_size();
    let mut done = 0;
    while done < need {
        let src = play.ring.readable();
        let n = (src.len() / fsize).min(need - done);
        codec.decode(&src[..n * fsize], &mut play.dec_buf[done * nch..(done + n) * nch]);
        play.ring.discard(n);
        done += n;
    }
    let (frames, buf) = match play.resamp.as_mut() {
        Some(r) => {
            let out = &mut play.res_buf[..geo.round as usize * nch];
            (r.process(&play.dec_buf[..need * nch], out), &play.res_buf)
        }
        None => (need, &play.dec_buf),
    };
    let map_gain = gain / play.joins as i32;
    for map in &play.maps {
        map.add(buf, mix, map_gain, frames.min(geo.round as usize));
    }
}

/// Discard `need` input frames as if they had been played, keeping the
/// resampler phase moving.
fn discard_block(play: &mut PlayChain, need: usize, nch: usize, out_frames: usize) {
    if let Some(r) = play.resamp.as_mut() {
        play.dec_buf[..need * nch].fill(0);
        let out = &mut play.res_buf[..out_frames * nch];
        r.process(&play.dec_buf[..need * nch], out);
    }
    play.ring.discard(need);
}

fn push_encoded(rec: &mut RecChain, codec: &SampleCodec, frames: usize, nch: usize, from_res: bool) {
    let fsize = rec.ring.frame_size();
    let buf = if from_res { &rec.res_buf } else { &rec.map_buf };
    codec.encode(&buf[..frames * nch], &mut rec.enc_buf[..frames * fsize]);
    rec.ring.write(&rec.enc_buf[..frames * fsize]);
}

enum Dir {
    Play,
    Rec,
}

/// Build the mapper passes for one direction. Join and expand are
/// composed here as repeated passes at increasing channel offsets, with
/// the join factor returned so the caller can pre-divide its gain.
fn mappers(chan: &ChannelRange, dup: bool, dev_nch: usize, dir: Dir) -> (Vec<ChannelMapper>, usize) {
    let snch = chan.count();
    let start = chan.min.min(dev_nch.saturating_sub(1));
    let width = dev_nch - start;
    // source is the stream when playing, the device when recording
    let (src_nch, dst_nch, src_off, dst_off, src_cnt, dst_cnt) = match dir {
        Dir::Play => (snch, dev_nch, 0, start, snch, width),
        Dir::Rec => (dev_nch, snch, start, 0, width, snch),
    };
    let mut maps = vec![];
    let mut joins = 1;
    if dup && dst_cnt >= 2 * src_cnt {
        // expand: duplicate the source across the wider side
        let copies = dst_cnt.div_ceil(src_cnt);
        for j in 0..copies {
            let nch = src_cnt.min(dst_cnt - j * src_cnt);
            maps.push(ChannelMapper::with_offsets(
                src_nch,
                dst_nch,
                src_off,
                dst_off + j * src_cnt,
                nch,
            ));
        }
    } else if dup && src_cnt > dst_cnt {
        // join: fold the extra source channels down, averaged
        joins = src_cnt.div_ceil(dst_cnt);
        for j in 0..joins {
            let nch = dst_cnt.min(src_cnt - j * dst_cnt);
            maps.push(ChannelMapper::with_offsets(
                src_nch,
                dst_nch,
                src_off + j * dst_cnt,
                dst_off,
                nch,
            ));
        }
    } else {
        maps.push(ChannelMapper::with_offsets(
            src_nch,
            dst_nch,
            src_off,
            dst_off,
            src_cnt.min(dst_cnt),
        ));
    }
    (maps, joins)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> DevGeometry {
        DevGeometry {
            rate: 48000,
            round: 480,
            bufsz: 1920,
            pchan: 2,
            rchan: 2,
        }
    }

    fn params(mode: SlotMode) -> SlotParams {
        SlotParams {
            name: "t".into(),
            mode,
            enc: Encoding::s16_ne(),
            rate: 48000,
            chan: ChannelRange::new(0, 1).unwrap(),
            dup: false,
            appbufsz: 960,
            xrun: XrunPolicy::Sync,
            mmc: false,
            vol: VOL_MAX,
        }
    }

    #[test]
    fn rejects_bad_negotiation() {
        let mut p = params(SlotMode::Play);
        p.enc.bits = 40;
        assert!(Slot::new(p, &geo()).is_err());
        let mut p = params(SlotMode::Play);
        p.chan = ChannelRange::new(4, 5).unwrap();
        assert!(Slot::new(p, &geo()).is_err());
        let mut p = params(SlotMode::Rec);
        p.rate = 0;
        assert!(Slot::new(p, &geo()).is_err());
    }

    #[test]
    fn play_slot_becomes_ready_when_full() {
        let g = geo();
        let mut s = Slot::new(params(SlotMode::Play), &g).unwrap();
        assert_eq!(s.state, SlotState::Init);
        s.start(&g).unwrap();
        assert_eq!(s.state, SlotState::Start);
        assert!(!s.check_ready());
        let bytes = vec![0u8; s.write_credit()];
        s.write_data(&bytes).unwrap();
        assert!(s.check_ready());
        s.attach();
        assert_eq!(s.state, SlotState::Run);
    }

    #[test]
    fn rec_slot_ready_immediately() {
        let g = geo();
        let mut s = Slot::new(params(SlotMode::Rec), &g).unwrap();
        s.start(&g).unwrap();
        assert!(s.check_ready());
    }

    #[test]
    fn overlong_write_is_protocol_violation() {
        let g = geo();
        let mut s = Slot::new(params(SlotMode::Play), &g).unwrap();
        s.start(&g).unwrap();
        let bytes = vec![0u8; s.write_credit() + 4];
        assert!(s.write_data(&bytes).is_err());
    }

    #[test]
    fn stop_drains_then_finishes() {
        let g = geo();
        let mut s = Slot::new(params(SlotMode::Play), &g).unwrap();
        s.start(&g).unwrap();
        let bytes = vec![0u8; 480 * 4];
        s.write_data(&bytes).unwrap();
        assert!(!s.request_stop());
        assert_eq!(s.state, SlotState::Stop);
        let mut mix = vec![0i32; 480 * 2];
        assert_eq!(s.run_play(&mut mix, &g), CycleResult::Ran);
        assert!(s.drained());
        s.finish();
        assert_eq!(s.state, SlotState::Init);
    }

    #[test]
    fn clock_remainder_carries() {
        let g = geo();
        let mut p = params(SlotMode::Play);
        p.rate = 44100;
        let mut s = Slot::new(p, &g).unwrap();
        // 480 * 44100 / 48000 = 441 exactly; try a ragged rate too
        for _ in 0..10 {
            s.advance_clock(&g);
        }
        let (_, delta) = s.take_credit();
        assert_eq!(delta, 4410);
        let mut p = params(SlotMode::Play);
        p.rate = 32123;
        let mut s = Slot::new(p, &g).unwrap();
        for _ in 0..100 {
            s.advance_clock(&g);
        }
        let (_, delta) = s.take_credit();
        // 100 cycles * 480 frames = one second, remainders cancel out
        assert_eq!(delta, 32123);
    }
}
