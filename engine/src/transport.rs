use midly::live::{LiveEvent, MtcQuarterFrameMessage, SystemCommon};
use midly::num::u4;
use tracing::warn;

/// MTC frame rates. Drop-frame is not emitted; 30 fps is the
/// non-drop variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fps {
    F24,
    F25,
    F30,
}

impl Fps {
    pub fn frames(&self) -> u32 {
        match self {
            Fps::F24 => 24,
            Fps::F25 => 25,
            Fps::F30 => 30,
        }
    }

    fn rate_code(&self) -> u8 {
        match self {
            Fps::F24 => 0,
            Fps::F25 => 1,
            Fps::F30 => 3,
        }
    }

    /// Pick a rate whose quarter-frame period divides the audio rate
    /// evenly, so timecode never drifts against the device clock.
    pub fn for_rate(rate: u32) -> Option<Fps> {
        [Fps::F25, Fps::F30, Fps::F24]
            .into_iter()
            .find(|fps| rate % (fps.frames() * 4) == 0)
    }
}

/// MMC transport request carried inside a sysex message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmcCommand {
    Start,
    Stop,
    Locate { hr: u8, min: u8, sec: u8, fr: u8 },
}

/// Quarter-frame timecode emitter driven by the device cycle. The
/// device advances it by the cycle's frame count; whenever a
/// quarter-frame boundary is crossed the next nibble of MIDI Time Code
/// is appended to the output buffer. Absolute position goes out as a
/// full-frame sysex on start and relocate.
#[derive(Debug)]
pub struct TransportSync {
    fps: Fps,
    /// audio frames per quarter-frame tick
    qfr_period: u32,
    delta: u32,
    /// next quarter-frame piece, 0..8
    qf: u8,
    hr: u8,
    min: u8,
    sec: u8,
    fr: u8,
    running: bool,
    dev_id: u8,
}

impl TransportSync {
    pub fn new(rate: u32, fps: Fps, dev_id: u8) -> Result<Self, String> {
        let ticks = fps.frames() * 4;
        if rate % ticks != 0 {
            return Err(format!(
                "{} fps timecode does not divide a {rate} Hz clock",
                fps.frames()
            ));
        }
        Ok(Self {
            fps,
            qfr_period: rate / ticks,
            delta: 0,
            qf: 0,
            hr: 0,
            min: 0,
            sec: 0,
            fr: 0,
            running: false,
            dev_id,
        })
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn fps(&self) -> Fps {
        self.fps
    }

    pub fn set_position(&mut self, hr: u8, min: u8, sec: u8, fr: u8) {
        self.hr = hr % 24;
        self.min = min % 60;
        self.sec = sec % 60;
        self.fr = fr % self.fps.frames() as u8;
    }

    /// Begin emitting timecode; announces the absolute origin first.
    pub fn start(&mut self, out: &mut Vec<u8>) {
        self.running = true;
        self.delta = 0;
        self.qf = 0;
        self.full_frame(out);
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Advance by one device cycle worth of audio frames, appending any
    /// quarter-frame messages that became due.
    pub fn advance(&mut self, frames: u32, out: &mut Vec<u8>) {
        if !self.running {
            return;
        }
        self.delta += frames;
        while self.delta >= self.qfr_period {
            self.delta -= self.qfr_period;
            self.quarter_frame(out);
        }
    }

    fn quarter_frame(&mut self, out: &mut Vec<u8>) {
        let (msg, value) = match self.qf {
            0 => (MtcQuarterFrameMessage::FramesLow, self.fr & 0xF),
            1 => (MtcQuarterFrameMessage::FramesHigh, self.fr >> 4),
            2 => (MtcQuarterFrameMessage::SecondsLow, self.sec & 0xF),
            3 => (MtcQuarterFrameMessage::SecondsHigh, self.sec >> 4),
            4 => (MtcQuarterFrameMessage::MinutesLow, self.min & 0xF),
            5 => (MtcQuarterFrameMessage::MinutesHigh, self.min >> 4),
            6 => (MtcQuarterFrameMessage::HoursLow, self.hr & 0xF),
            _ => (
                MtcQuarterFrameMessage::HoursHigh,
                (self.fps.rate_code() << 1) | (self.hr >> 4),
            ),
        };
        let ev = LiveEvent::Common(SystemCommon::MidiTimeCodeQuarterFrame(msg, u4::new(value)));
        if ev.write(out).is_err() {
            warn!("dropped quarter-frame message");
        }
        self.qf += 1;
        if self.qf == 8 {
            self.qf = 0;
            // the eight pieces described the time at piece 0; two full
            // frames have elapsed since
            self.bump_frames(2);
        }
    }

    fn bump_frames(&mut self, n: u8) {
        self.fr += n;
        let fps = self.fps.frames() as u8;
        while self.fr >= fps {
            self.fr -= fps;
            self.sec += 1;
        }
        while self.sec >= 60 {
            self.sec -= 60;
            self.min += 1;
        }
        while self.min >= 60 {
            self.min -= 60;
            self.hr = (self.hr + 1) % 24;
        }
    }

    /// Absolute-position ("full frame") sysex.
    fn full_frame(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[
            0xF0,
            0x7F,
            self.dev_id,
            0x01,
            0x01,
            (self.fps.rate_code() << 5) | self.hr,
            self.min,
            self.sec,
            self.fr,
            0xF7,
        ]);
    }

    /// Parse an incoming sysex as an MMC command addressed to this
    /// device (or broadcast). Returns None for anything else.
    pub fn parse_mmc(&self, bytes: &[u8]) -> Option<MmcCommand> {
        let [0xF0, 0x7F, dev, 0x06, rest @ ..] = bytes else {
            return None;
        };
        if *dev != self.dev_id && *dev != 0x7F {
            return None;
        }
        match rest {
            [0x01, 0xF7] => Some(MmcCommand::Stop),
            [0x02, 0xF7] | [0x03, 0xF7] => Some(MmcCommand::Start),
            [0x44, 0x06, 0x01, hr, min, sec, fr, _sub, 0xF7] => Some(MmcCommand::Locate {
                hr: hr & 0x1F,
                min: *min,
                sec: *sec,
                fr: *fr,
            }),
            _ => None,
        }
    }
}
