//! One direction of a relayed connection
//!
//! A pump reads a chunk from its source, writes it to its sink until the
//! chunk is gone, and only then reads again. Short writes keep the rest of
//! the chunk buffered. When the source ends, or either side fails, the sink
//! is shut down so the peer sees end-of-stream.

use std::io::{self, ErrorKind};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes buffered per direction
pub const RELAY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Idle,
    /// Waiting for data from the source
    Receiving,
    /// Holding unsent bytes for the sink
    Forwarding,
    Done,
}

pub struct Pump<R, W> {
    reader: R,
    writer: W,
    buf: Vec<u8>,
    cursor: usize,
    unsent: usize,
    forwarded: u64,
    state: PumpState,
}

impl<R, W> Pump<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self::with_capacity(reader, writer, RELAY_BUFFER_SIZE)
    }

    pub fn with_capacity(reader: R, writer: W, capacity: usize) -> Self {
        Self {
            reader,
            writer,
            buf: vec![0; capacity.max(1)],
            cursor: 0,
            unsent: 0,
            forwarded: 0,
            state: PumpState::Idle,
        }
    }

    pub fn state(&self) -> PumpState {
        self.state
    }

    /// Bytes delivered to the sink so far
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    /// Bytes read but not yet delivered
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.cursor..self.cursor + self.unsent]
    }

    /// Move data until the source ends or either side fails.
    ///
    /// Returns the number of bytes delivered on orderly close. The sink is
    /// shut down in both cases.
    pub async fn run(&mut self) -> io::Result<u64> {
        let result = self.pump().await;
        self.state = PumpState::Done;

        if let Err(e) = self.writer.shutdown().await {
            log::trace!("relay: shutdown after pump finished: {}", e);
        }
        result.map(|()| self.forwarded)
    }

    async fn pump(&mut self) -> io::Result<()> {
        loop {
            if self.unsent == 0 {
                self.state = PumpState::Receiving;
                let n = match self.reader.read(&mut self.buf).await {
                    Ok(0) => return Ok(()),
                    Ok(n) => n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                };
                self.cursor = 0;
                self.unsent = n;
            }

            self.state = PumpState::Forwarding;
            let chunk = &self.buf[self.cursor..self.cursor + self.unsent];
            match self.writer.write(chunk).await {
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::WriteZero,
                        "peer stopped accepting data",
                    ))
                }
                Ok(n) => {
                    self.cursor += n;
                    self.unsent -= n;
                    self.forwarded += n as u64;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            if self.unsent == 0 {
                self.writer.flush().await?;
            }
        }
    }
}
