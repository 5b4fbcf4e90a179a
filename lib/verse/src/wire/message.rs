use crate::cmd::node::{self, NodeCmd};
use crate::cmd::sys::{self, SysCmd};
use crate::error::{ErrorType, NetworkError, NetworkResult};
use crate::wire::SizedWrite;
use crate::{MAX_SYSTEM_COMMAND_COUNT, PROTOCOL_VERSION};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

pub const MESSAGE_HEADER_SIZE: usize = 4;

/// One reliable-stream PDU: version nibble, a reserved octet, a u16 total
/// length, then system commands. After the handshake, when the stream is
/// also the data plane, node commands follow within the announced length.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub sys_cmds: Vec<SysCmd>,
    pub node_cmds: Vec<NodeCmd>,
}

impl Message {
    #[inline]
    pub fn new() -> Message {
        Message {
            sys_cmds: Vec::new(),
            node_cmds: Vec::new(),
        }
    }

    #[inline]
    pub fn with_cmds(sys_cmds: Vec<SysCmd>) -> Message {
        Message {
            sys_cmds,
            node_cmds: Vec::new(),
        }
    }

    /// Parses one message off the front of `buffer`. Returns `Wait` while
    /// the buffer holds only part of a message, so a partial read carries
    /// over to the next wakeup.
    pub fn unpack(buffer: &[u8]) -> NetworkResult<(Message, usize)> {
        if buffer.len() < MESSAGE_HEADER_SIZE {
            return Err(NetworkError::Wait);
        }

        let version = buffer[0] >> 4;
        if version != PROTOCOL_VERSION {
            return Err(NetworkError::Fatal(ErrorType::BadVersion));
        }

        let mut stream = Cursor::new(&buffer[2..4]);
        let length = usize::from(stream.read_u16::<BigEndian>()?);

        if length < MESSAGE_HEADER_SIZE {
            return Err(NetworkError::Fatal(ErrorType::BadLength));
        }

        if buffer.len() < length {
            return Err(NetworkError::Wait);
        }

        let (sys_cmds, sys_len) = sys::unpack_sys_cmds(&buffer[MESSAGE_HEADER_SIZE..length]);

        let body = &buffer[MESSAGE_HEADER_SIZE + sys_len..length];
        let (node_cmds, _) = node::unpack_body(body);

        Ok((
            Message {
                sys_cmds,
                node_cmds,
            },
            length,
        ))
    }

    /// Packs the message with its computed length. Returns the octets
    /// written.
    pub fn pack<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<usize> {
        debug_assert!(self.sys_cmds.len() <= MAX_SYSTEM_COMMAND_COUNT);

        let length = self.wire_len()?;

        if stream.free_capacity() < length {
            return Err(NetworkError::Wait);
        }

        stream.write_u8(PROTOCOL_VERSION << 4)?;
        stream.write_u8(0)?;
        stream.write_u16::<BigEndian>(length as u16)?;

        for cmd in &self.sys_cmds {
            cmd.pack(stream)?;
        }

        for cmd in &self.node_cmds {
            node::pack_group(stream, std::slice::from_ref(cmd), 0)?;
        }

        Ok(length)
    }

    /// Total wire length of the message.
    pub fn wire_len(&self) -> NetworkResult<usize> {
        let sys: usize = self.sys_cmds.iter().map(SysCmd::wire_len).sum();
        let body: usize = self.node_cmds.iter().map(NodeCmd::wire_len).sum();
        let length = MESSAGE_HEADER_SIZE + sys + body;

        if length > u16::max_value() as usize {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        Ok(length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::sys::{Negotiate, UA_METHOD_NONE};
    use crate::negotiate::{FTR_CLIENT_NAME, FTR_DED};

    fn packed(message: &Message) -> Vec<u8> {
        let mut buffer = vec![0u8; 1024];
        let written;
        {
            let mut stream = Cursor::new(&mut buffer[..]);
            written = message.pack(&mut stream).unwrap();
        }
        buffer.truncate(written);
        buffer
    }

    #[test]
    fn test_roundtrip_handshake_message() {
        let message = Message::with_cmds(vec![
            SysCmd::UserAuthRequest {
                username: "singer".to_owned(),
                method: UA_METHOD_NONE,
                data: String::new(),
            },
            SysCmd::ChangeL(Negotiate::string8(FTR_CLIENT_NAME, &["probe"])),
        ]);

        let buffer = packed(&message);

        assert_eq!(buffer[0], PROTOCOL_VERSION << 4);

        let (parsed, consumed) = Message::unpack(&buffer).unwrap();

        assert_eq!(consumed, buffer.len());
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_partial_header_waits() {
        assert_eq!(Message::unpack(&[0x10, 0]).unwrap_err(), NetworkError::Wait);
    }

    #[test]
    fn test_partial_body_waits() {
        let message = Message::with_cmds(vec![SysCmd::ConfirmL(Negotiate::string8(FTR_DED, &["ded-v1"]))]);
        let buffer = packed(&message);

        assert_eq!(
            Message::unpack(&buffer[..buffer.len() - 1]).unwrap_err(),
            NetworkError::Wait
        );
    }

    #[test]
    fn test_two_messages_in_one_buffer() {
        let first = Message::with_cmds(vec![SysCmd::UserAuthSuccess { user_id: 4, avatar_id: 19 }]);
        let second = Message::with_cmds(vec![SysCmd::ConfirmL(Negotiate::string8(FTR_DED, &["ded-v1"]))]);

        let mut buffer = packed(&first);
        buffer.extend(packed(&second));

        let (parsed_first, consumed) = Message::unpack(&buffer).unwrap();
        assert_eq!(parsed_first, first);

        let (parsed_second, rest) = Message::unpack(&buffer[consumed..]).unwrap();
        assert_eq!(parsed_second, second);
        assert_eq!(consumed + rest, buffer.len());
    }

    #[test]
    fn test_bad_version_is_fatal() {
        let buffer = [0x20u8, 0, 0, 4];

        assert_eq!(
            Message::unpack(&buffer).unwrap_err(),
            NetworkError::Fatal(ErrorType::BadVersion)
        );
    }

    #[test]
    fn test_data_phase_message_carries_node_cmds() {
        let mut message = Message::new();
        message.sys_cmds.push(SysCmd::Ack { pay_id: 1 });
        message.node_cmds.push(NodeCmd::new(44, vec![0, 1], vec![9, 9, 9]));

        let buffer = packed(&message);
        let (parsed, _) = Message::unpack(&buffer).unwrap();

        assert_eq!(parsed, message);
    }
}
