use crate::{
    error::{Error, Result},
    io::{Reader, Writer},
};

/// A positioned cursor over a byte buffer. Reads and writes advance the
/// position; `set_position` allows patching fields whose values are only
/// known after later data has been laid out.
pub struct Stream<T> {
    buffer: T,
    position: usize,
}

impl<T> Stream<T> {
    pub fn new(buffer: T) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }
}

impl<T: AsRef<[u8]>> Reader for Stream<T> {
    fn read_slice(&mut self, size: usize) -> Result<&[u8]> {
        let data = self.buffer.as_ref();
        if data.len() < self.position + size {
            return Err(Error::short_read(size));
        }
        let data_pos = self.position;
        self.position += size;
        Ok(&data[data_pos..data_pos + size])
    }
}

impl Writer for Stream<&mut [u8]> {
    fn write_slice(&mut self, data: &[u8]) -> Result<()> {
        if self.position + data.len() > self.buffer.len() {
            return Err(Error::short_write(data.len()));
        }
        self.buffer[self.position..self.position + data.len()].copy_from_slice(data);
        self.position += data.len();
        Ok(())
    }
}

impl Writer for Stream<Vec<u8>> {
    fn write_slice(&mut self, data: &[u8]) -> Result<()> {
        let end_pos = self.position + data.len();
        if self.buffer.len() < end_pos {
            self.buffer.resize(end_pos, 0);
        }
        self.buffer[self.position..end_pos].copy_from_slice(data);
        self.position = end_pos;
        Ok(())
    }
}
