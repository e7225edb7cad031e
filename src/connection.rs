// ABOUTME: Provides per-connection buffered I/O for the ASCII cache protocol
// ABOUTME: Implements record-framed reads with idle tracking and reply serialization

use crate::command::Response;
use crate::frame::{self, Frame};
use bytes::{Buf, BytesMut};
use std::io::{self, Cursor};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

/// Size of each socket read. The receive buffer only grows while a record
/// is incomplete; consumed prefixes are released between records.
const READ_CHUNK_SIZE: usize = 1024;

/// Byte-stream framing over one client socket.
///
/// Reads accumulate into an internal buffer from which whole command
/// records are extracted left-to-right. Pipelined records delivered by a
/// single read are drained by repeated `read_frame` calls without touching
/// the socket again, so commands execute in arrival order. Writes go
/// through a buffered stream and are flushed per reply.
#[derive(Debug)]
pub struct Connection {
    stream: BufWriter<TcpStream>,
    buffer: BytesMut,
    // When the last bytes arrived. Idle deadlines are measured from here,
    // not from connection open.
    last_activity: Instant,
}

impl Connection {
    /// Create a new `Connection`, backed by `socket`. Read and write
    /// buffers are initialized.
    pub fn new(socket: TcpStream) -> Connection {
        Connection {
            stream: BufWriter::new(socket),
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            last_activity: Instant::now(),
        }
    }

    /// How long the peer has been silent.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Read a single command record from the underlying stream.
    ///
    /// The function waits until it has retrieved enough data to extract a
    /// record. Any data remaining in the read buffer after the record has
    /// been extracted is kept there for the next call to `read_frame`.
    ///
    /// # Returns
    ///
    /// On success, the extracted record is returned. If the `TcpStream`
    /// is closed in a way that doesn't break a record in half, it returns
    /// `None`. Otherwise, an error is returned and no partial record is
    /// ever surfaced.
    pub async fn read_frame(&mut self) -> crate::Result<Option<Frame>> {
        loop {
            // Attempt to extract a record from the buffered data. If enough
            // data has been buffered, the record is returned.
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            // There is not enough buffered data to extract a record.
            // Attempt to read more data from the socket.
            //
            // On success, the number of bytes is returned. `0` indicates
            // "end of stream".
            self.buffer.reserve(READ_CHUNK_SIZE);
            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                // The remote closed the connection. For this to be a clean
                // shutdown, there should be no data in the read buffer. If
                // there is, the peer closed the socket while sending a
                // record.
                return self
                    .buffer
                    .is_empty()
                    .then(|| None)
                    .ok_or_else(|| "connection reset by peer".into());
            }
            self.last_activity = Instant::now();
        }
    }

    /// Tries to extract a record from the buffer. If the buffer contains a
    /// complete record, it is returned and its bytes removed from the
    /// buffer. If not enough data has been buffered yet, `Ok(None)` is
    /// returned. If the buffered data does not represent a valid record,
    /// `Err` is returned.
    fn parse_frame(&mut self) -> crate::Result<Option<Frame>> {
        use frame::Error::Incomplete;

        // Cursor is used to track the "current" location in the buffer
        // while the record boundary scan runs.
        let mut buf = Cursor::new(&self.buffer[..]);

        match Frame::check(&mut buf) {
            Ok(len) => {
                // Reset the position to zero before handing the cursor to
                // `Frame::parse`.
                buf.set_position(0);

                let frame = Frame::parse(&mut buf)?;

                // Discard the extracted record from the read buffer.
                self.buffer.advance(len);

                Ok(Some(frame))
            }
            // There is not enough data present in the read buffer to
            // extract a record. We must wait for more data to be received
            // from the socket.
            //
            // We do not want to return `Err` from here as this "error" is
            // an expected runtime condition.
            Err(Incomplete) => Ok(None),
            // The buffered data is malformed. Returning `Err` from here
            // will result in the connection being closed.
            Err(e) => Err(e.into()),
        }
    }

    /// Write a single reply line, delimiter included, to the underlying
    /// stream and flush it out.
    pub async fn write_response(&mut self, response: &Response) -> io::Result<()> {
        self.stream.write_all(response.to_string().as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;

        // The calls above went to the buffered stream; `flush` pushes the
        // remaining contents of the buffer down to the socket.
        self.stream.flush().await
    }
}
