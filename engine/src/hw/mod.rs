use std::io;

pub mod loopback;

pub use loopback::Loopback;

/// Hardware-facing collaborator of a device. Implementations are
/// non-blocking: a block transfer either completes immediately or
/// reports how much it moved; the reactor re-invokes the cycle when the
/// hardware signals completion.
pub trait HwDevice: Send {
    fn start(&mut self) -> io::Result<()>;
    fn stop(&mut self) -> io::Result<()>;
    /// Write one encoded play block; returns frames accepted.
    fn write_block(&mut self, bytes: &[u8]) -> io::Result<usize>;
    /// Read one encoded record block; returns frames filled.
    fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}
