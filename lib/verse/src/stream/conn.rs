use crate::error::{ErrorType, NetworkError, NetworkResult};
use crate::wire::message::Message;
use crate::wire::SizedWrite;
use slice_deque::SliceDeque;
use std::io::{self, Cursor};
use std::time::Instant;

const BUF_SIZE_INCREMENT: usize = 65536;

/// Default capacity of the per-connection buffers: one maximal message in
/// each direction.
pub const STREAM_BUF_SIZE: usize = BUF_SIZE_INCREMENT;

/// A buffered FIFO byte queue backed by a contiguous double-ended deque.
/// Data is appended at the tail and consumed from the head, so a partial
/// message carries over to the next read.
pub struct Buffer {
    data: SliceDeque<u8>,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        if size % BUF_SIZE_INCREMENT != 0 {
            panic!("Buffer size must be divisible by {}, got {}", BUF_SIZE_INCREMENT, size);
        }

        let mut data = SliceDeque::new();
        data.reserve(size);
        Buffer { data, size }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.data.len()
    }

    /// Slice of buffered data, oldest first.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Consumes `count` octets from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    #[inline]
    pub fn clear(&mut self) {
        let len = self.len();
        self.consume(len);
    }

    /// Appends raw octets at the tail.
    pub fn append(&mut self, octets: &[u8]) -> NetworkResult<()> {
        if octets.len() > self.free_capacity() {
            return Err(NetworkError::Wait);
        }

        self.data.extend_from_slice(octets);
        Ok(())
    }

    /// Reads from the source into the buffer until it would block or the
    /// buffer is full. A closed stream is an error distinct from "no data
    /// right now": EOF must never look like a spurious wakeup.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> NetworkResult<usize> {
        let mut total = 0usize;

        while self.data.len() < self.size {
            let read_count = unsafe {
                match reader.read(self.data.tail_head_slice()) {
                    Ok(0) => return Err(NetworkError::Fatal(ErrorType::StreamClosed)),
                    Ok(count) => count,
                    Err(error) => {
                        if error.kind() == io::ErrorKind::WouldBlock
                            || error.kind() == io::ErrorKind::Interrupted
                        {
                            return Ok(total);
                        }
                        return Err(error.into());
                    }
                }
            };

            unsafe { self.data.move_tail(read_count as isize) };
            total += read_count;
        }

        Ok(total)
    }

    /// Writes buffered data to the sink until it would block or the buffer
    /// drains.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> NetworkResult<usize> {
        let mut total = 0usize;

        while !self.data.is_empty() {
            match writer.write(self.data.as_slice()) {
                Ok(0) => return Err(NetworkError::Fatal(ErrorType::StreamClosed)),
                Ok(count) => {
                    self.consume(count);
                    total += count;
                }
                Err(error) => {
                    if error.kind() == io::ErrorKind::WouldBlock
                        || error.kind() == io::ErrorKind::Interrupted
                    {
                        return Ok(total);
                    }
                    return Err(error.into());
                }
            }
        }

        Ok(total)
    }
}

/// States of the stream handshake. UsrauthNone/UsrauthData belong to the
/// client; Listen through RespondUsrauth to the server; the rest are
/// shared.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamState {
    Reserved,
    UsrauthNone,
    UsrauthData,
    Listen,
    RespondMethods,
    RespondUsrauth,
    NegotiateCookieDed,
    NegotiateNewhost,
    StreamOpen,
    Closing,
    Closed,
}

/// A reliable ordered byte channel between peers, plain or TLS. Owns the
/// buffers; the sockets stay with the worker.
pub struct StreamConn {
    pub state: StreamState,
    pub state_began: Instant,
    pub recv_buffer: Buffer,
    pub send_buffer: Buffer,
    pub socket_buffer_size: usize,
    pub corrupted_messages: u64,
}

impl StreamConn {
    pub fn new(state: StreamState, now: Instant) -> StreamConn {
        StreamConn {
            state,
            state_began: now,
            recv_buffer: Buffer::new(STREAM_BUF_SIZE),
            send_buffer: Buffer::new(STREAM_BUF_SIZE),
            socket_buffer_size: STREAM_BUF_SIZE,
            corrupted_messages: 0,
        }
    }

    pub fn set_state(&mut self, state: StreamState, now: Instant) {
        self.state = state;
        self.state_began = now;
    }

    #[inline]
    pub fn cmp_state(&self, state: StreamState) -> bool {
        self.state == state
    }

    /// Pops the next complete message off the receive buffer. `Wait` means
    /// a partial message is still in flight.
    pub fn read_message(&mut self) -> NetworkResult<Message> {
        let (message, consumed) = Message::unpack(self.recv_buffer.read_slice())?;
        self.recv_buffer.consume(consumed);
        Ok(message)
    }

    /// Serializes a message into the send buffer.
    pub fn write_message(&mut self, message: &Message) -> NetworkResult<usize> {
        let length = message.wire_len()?;

        if self.send_buffer.free_capacity() < length {
            return Err(NetworkError::Wait);
        }

        let mut scratch = vec![0u8; length];
        {
            let mut stream = Cursor::new(&mut scratch[..]);
            message.pack(&mut stream)?;
        }

        self.send_buffer.append(&scratch)?;
        Ok(length)
    }
}
