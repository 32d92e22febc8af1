/// Fixed-capacity ring of frames. The read cursor is `start`, the write
/// position is `(start + used) % capacity`; readable and writable region
/// lengths always sum to the capacity. Allocated once when the owning
/// slot or device is set up, never grows.
#[derive(Debug)]
pub struct RingBuffer {
    data: Vec<u8>,
    frame_size: usize,
    capacity: usize,
    start: usize,
    used: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize, frame_size: usize) -> Self {
        Self {
            data: vec![0; capacity * frame_size],
            frame_size,
            capacity,
            start: 0,
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Frames ready to be read.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Frames that can still be written.
    pub fn avail(&self) -> usize {
        self.capacity - self.used
    }

    pub fn empty(&self) -> bool {
        self.used == 0
    }

    pub fn full(&self) -> bool {
        self.used == self.capacity
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.used = 0;
    }

    /// Longest contiguous readable run starting at the read cursor, in
    /// frames. The region may wrap; a second call after `discard` picks
    /// up the remainder.
    pub fn readable(&self) -> &[u8] {
        let run = self.used.min(self.capacity - self.start);
        let off = self.start * self.frame_size;
        &self.data[off..off + run * self.frame_size]
    }

    /// Longest contiguous writable run at the write position, in frames.
    pub fn writable(&mut self) -> &mut [u8] {
        let wpos = (self.start + self.used) % self.capacity;
        let run = (self.capacity - self.used).min(self.capacity - wpos);
        let off = wpos * self.frame_size;
        &mut self.data[off..off + run * self.frame_size]
    }

    /// Mark `frames` of the writable region as filled.
    pub fn commit(&mut self, frames: usize) {
        debug_assert!(frames <= self.avail());
        self.used += frames;
    }

    /// Drop `frames` from the front of the readable region.
    pub fn discard(&mut self, frames: usize) {
        debug_assert!(frames <= self.used);
        self.start = (self.start + frames) % self.capacity;
        self.used -= frames;
    }

    /// Copy in as many whole frames from `src` as fit; returns frames
    /// written. Handles the wrap internally.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let mut frames = (src.len() / self.frame_size).min(self.avail());
        let total = frames;
        let mut off = 0;
        let frame_size = self.frame_size;
        while frames > 0 {
            let dst = self.writable();
            let n = (dst.len() / frame_size).min(frames);
            let bytes = n * frame_size;
            dst[..bytes].copy_from_slice(&src[off..off + bytes]);
            self.commit(n);
            off += bytes;
            frames -= n;
        }
        total
    }

    /// Copy out up to `dst.len() / frame_size` frames; returns frames read.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let mut frames = (dst.len() / self.frame_size).min(self.used);
        let total = frames;
        let mut off = 0;
        while frames > 0 {
            let src = self.readable();
            let n = (src.len() / self.frame_size).min(frames);
            let bytes = n * self.frame_size;
            dst[off..off + bytes].copy_from_slice(&src[..bytes]);
            off += bytes;
            self.discard(n);
            frames -= n;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::RingBuffer;

    #[test]
    fn regions_sum_to_capacity() {
        let mut ring = RingBuffer::new(16, 4);
        let writes = [5usize, 3, 7, 1, 4, 6, 2, 8];
        let reads = [2usize, 4, 1, 6, 3, 5, 7, 2];
        for (&w, &r) in writes.iter().zip(reads.iter()) {
            let w = w.min(ring.avail());
            ring.commit(w);
            assert!(ring.used() <= ring.capacity());
            let r = r.min(ring.used());
            ring.discard(r);
            assert!(ring.used() <= ring.capacity());
            assert_eq!(ring.used() + ring.avail(), ring.capacity());
        }
    }

    #[test]
    fn write_read_wraps() {
        let mut ring = RingBuffer::new(4, 2);
        // shift the cursor so the next write wraps
        ring.commit(3);
        ring.discard(3);
        let src = [1u8, 2, 3, 4, 5, 6];
        assert_eq!(ring.write(&src), 3);
        assert!(ring.full() || ring.used() == 3);
        let mut dst = [0u8; 6];
        assert_eq!(ring.read(&mut dst), 3);
        assert_eq!(dst, src);
        assert!(ring.empty());
    }

    #[test]
    fn write_stops_at_capacity() {
        let mut ring = RingBuffer::new(2, 1);
        assert_eq!(ring.write(&[9, 9, 9, 9]), 2);
        assert_eq!(ring.avail(), 0);
        assert_eq!(ring.write(&[7]), 0);
    }
}
