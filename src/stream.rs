//! Ring buffer for streaming audio with overlapping chunk extraction.

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("overlap size {overlap} must be less than chunk size {chunk}")]
    InvalidOverlap { overlap: usize, chunk: usize },
    #[error("chunk size {chunk} exceeds capacity {capacity}")]
    ChunkExceedsCapacity { chunk: usize, capacity: usize },
}

/// Bounded circular buffer that yields fixed-size chunks with overlap.
///
/// The overlap is chosen by the caller to equal `frame_length - frame_shift`
/// of the downstream feature extractor, so frames straddling a chunk boundary
/// are not lost regardless of where the producer cuts the stream.
pub struct StreamingBuffer {
    capacity: usize,
    chunk_size: usize,
    overlap_size: usize,
    buffer: Vec<f32>,
    write_pos: usize,
    available: usize,
}

impl StreamingBuffer {
    pub fn new(
        capacity: usize,
        chunk_size: usize,
        overlap_size: usize,
    ) -> Result<Self, StreamError> {
        if overlap_size >= chunk_size {
            return Err(StreamError::InvalidOverlap {
                overlap: overlap_size,
                chunk: chunk_size,
            });
        }
        if chunk_size > capacity {
            return Err(StreamError::ChunkExceedsCapacity {
                chunk: chunk_size,
                capacity,
            });
        }

        Ok(Self {
            capacity,
            chunk_size,
            overlap_size,
            buffer: vec![0.0; capacity],
            write_pos: 0,
            available: 0,
        })
    }

    /// Append samples, dropping whatever does not fit. Returns the number of
    /// samples actually written. Never blocks.
    pub fn append(&mut self, data: &[f32]) -> usize {
        let to_write = data.len().min(self.capacity - self.available);

        for &sample in &data[..to_write] {
            self.buffer[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % self.capacity;
        }

        if to_write < data.len() {
            log::warn!(
                "streaming buffer full: dropped {} of {} samples",
                data.len() - to_write,
                data.len()
            );
        }

        self.available += to_write;
        to_write
    }

    pub fn has_chunk(&self) -> bool {
        self.available >= self.chunk_size
    }

    /// Copy the next chunk into `out` and advance the read position by
    /// `chunk_size - overlap_size`. Returns false (leaving `out` empty) when
    /// fewer than `chunk_size` samples are buffered.
    pub fn next_chunk(&mut self, out: &mut Vec<f32>) -> bool {
        if !self.has_chunk() {
            out.clear();
            return false;
        }

        out.resize(self.chunk_size, 0.0);
        let read_pos = (self.write_pos + self.capacity - self.available) % self.capacity;
        for (i, dst) in out.iter_mut().enumerate() {
            *dst = self.buffer[(read_pos + i) % self.capacity];
        }

        self.available -= self.chunk_size - self.overlap_size;
        true
    }

    /// Copy all remaining samples into `out` and empty the buffer.
    pub fn drain(&mut self, out: &mut Vec<f32>) -> usize {
        out.clear();
        if self.available == 0 {
            return 0;
        }

        out.reserve(self.available);
        let read_pos = (self.write_pos + self.capacity - self.available) % self.capacity;
        for i in 0..self.available {
            out.push(self.buffer[(read_pos + i) % self.capacity]);
        }

        self.available = 0;
        out.len()
    }

    /// Reset positions; keeps the allocation.
    pub fn clear(&mut self) {
        self.available = 0;
        self.write_pos = 0;
    }

    pub fn available(&self) -> usize {
        self.available
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
