use std::collections::VecDeque;
use std::io;

use super::HwDevice;

/// Software device that plays nothing and records its own playback
/// after a fixed block delay. Lets the daemon and the tests run with no
/// audio hardware while still exercising the full duplex path.
#[derive(Debug)]
pub struct Loopback {
    frame_size: usize,
    /// bytes of silence queued ahead of the first played block
    queue: VecDeque<u8>,
    running: bool,
}

impl Loopback {
    pub fn new(frame_size: usize, latency_frames: usize) -> Self {
        Self {
            frame_size,
            queue: VecDeque::from(vec![0; latency_frames * frame_size]),
            running: false,
        }
    }
}

impl HwDevice for Loopback {
    fn start(&mut self) -> io::Result<()> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> io::Result<()> {
        self.running = false;
        Ok(())
    }

    fn write_block(&mut self, bytes: &[u8]) -> io::Result<usize> {
        if !self.running {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "not started"));
        }
        self.queue.extend(bytes);
        Ok(bytes.len() / self.frame_size)
    }

    fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.running {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "not started"));
        }
        let have = self.queue.len().min(buf.len());
        for b in buf.iter_mut().take(have) {
            *b = self.queue.pop_front().unwrap_or(0);
        }
        buf[have..].fill(0);
        Ok(buf.len() / self.frame_size)
    }
}
