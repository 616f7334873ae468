// PCM ring between the decode worker and the render callback

use parking_lot::Mutex;
use std::sync::Arc;

/// Fixed-capacity ring of interleaved f32 samples.
///
/// Writes and reads move whole frames only, so the reader never observes a
/// frame split across two calls.
pub struct PcmRing {
    buffer: Vec<f32>,
    channels: usize,
    read_pos: usize,
    len: usize,
    /// Bumped by every flush
    epoch: u64,
}

impl PcmRing {
    /// `capacity_frames` frames of `channels` samples each
    pub fn new(capacity_frames: usize, channels: u16) -> Self {
        let channels = channels.max(1) as usize;
        Self {
            buffer: vec![0.0; capacity_frames.max(1) * channels],
            channels,
            read_pos: 0,
            len: 0,
            epoch: 0,
        }
    }

    /// Capacity for `millis` of audio at `sample_rate`
    pub fn for_duration(millis: u64, sample_rate: u32, channels: u16) -> Self {
        let frames = (sample_rate as u64 * millis / 1000) as usize;
        Self::new(frames, channels)
    }

    pub fn channels(&self) -> u16 {
        self.channels as u16
    }

    fn capacity(&self) -> usize {
        self.buffer.len()
    }

    fn align(&self, samples: usize) -> usize {
        samples - samples % self.channels
    }

    /// Append as many whole frames of `data` as fit; returns samples taken
    pub fn write(&mut self, data: &[f32]) -> usize {
        let to_write = self.align(data.len().min(self.available_write()));
        if to_write == 0 {
            return 0;
        }

        let size = self.capacity();
        let write_pos = (self.read_pos + self.len) % size;
        let first = to_write.min(size - write_pos);
        self.buffer[write_pos..write_pos + first].copy_from_slice(&data[..first]);
        self.buffer[..to_write - first].copy_from_slice(&data[first..to_write]);

        self.len += to_write;
        to_write
    }

    /// Copy out up to `output.len()` samples, whole frames only
    pub fn read(&mut self, output: &mut [f32]) -> usize {
        let to_read = self.align(output.len().min(self.len));
        if to_read == 0 {
            return 0;
        }

        let size = self.capacity();
        let first = to_read.min(size - self.read_pos);
        output[..first].copy_from_slice(&self.buffer[self.read_pos..self.read_pos + first]);
        output[first..to_read].copy_from_slice(&self.buffer[..to_read - first]);

        self.read_pos = (self.read_pos + to_read) % size;
        self.len -= to_read;
        to_read
    }

    pub fn available_write(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn available_read(&self) -> usize {
        self.len
    }

    pub fn available_frames(&self) -> usize {
        self.len / self.channels
    }

    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.len = 0;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Drop queued samples and start a new epoch; returns it
    pub fn flush(&mut self) -> u64 {
        self.clear();
        self.epoch += 1;
        self.epoch
    }

    /// [`PcmRing::write`], but only for a writer still on the current epoch
    pub fn write_if(&mut self, epoch: u64, data: &[f32]) -> Option<usize> {
        (epoch == self.epoch).then(|| self.write(data))
    }

    /// Re-shape for a new format; drops queued samples, keeps the epoch
    pub fn reconfigure(&mut self, capacity_frames: usize, channels: u16) {
        let epoch = self.epoch;
        *self = Self::new(capacity_frames, channels);
        self.epoch = epoch;
    }
}

/// Shared handle; the render side uses the non-blocking calls
#[derive(Clone)]
pub struct SharedPcmRing {
    inner: Arc<Mutex<PcmRing>>,
}

impl SharedPcmRing {
    pub fn new(capacity_frames: usize, channels: u16) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PcmRing::new(capacity_frames, channels))),
        }
    }

    pub fn for_duration(millis: u64, sample_rate: u32, channels: u16) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PcmRing::for_duration(millis, sample_rate, channels))),
        }
    }

    pub fn write(&self, data: &[f32]) -> usize {
        self.inner.lock().write(data)
    }

    pub fn read(&self, output: &mut [f32]) -> usize {
        self.inner.lock().read(output)
    }

    /// Read without waiting on the lock; `None` if the writer holds it
    pub fn try_read(&self, output: &mut [f32]) -> Option<usize> {
        self.inner.try_lock().map(|mut ring| ring.read(output))
    }

    pub fn available_write(&self) -> usize {
        self.inner.lock().available_write()
    }

    pub fn available_read(&self) -> usize {
        self.inner.lock().available_read()
    }

    pub fn available_frames(&self) -> usize {
        self.inner.lock().available_frames()
    }

    pub fn channels(&self) -> u16 {
        self.inner.lock().channels()
    }

    pub fn clear(&self) {
        self.inner.lock().clear()
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch()
    }

    pub fn flush(&self) -> u64 {
        self.inner.lock().flush()
    }

    /// Epoch check and write under one lock, so a flush cannot slip between them
    pub fn write_if(&self, epoch: u64, data: &[f32]) -> Option<usize> {
        self.inner.lock().write_if(epoch, data)
    }

    pub fn reconfigure(&self, capacity_frames: usize, channels: u16) {
        self.inner.lock().reconfigure(capacity_frames, channels)
    }
}
