use crate::cmd::node::{self, NodeCmd};
use crate::cmd::sys::{self, SysCmd};
use crate::error::{ErrorType, NetworkError, NetworkResult};
use crate::wire::SizedWrite;
use crate::{MAX_SYSTEM_COMMAND_COUNT, PROTOCOL_VERSION};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

pub const PAY_FLAG: u8 = 0x80;
pub const ACK_FLAG: u8 = 0x40;
pub const ANK_FLAG: u8 = 0x20;
pub const SYN_FLAG: u8 = 0x10;
pub const FIN_FLAG: u8 = 0x08;

const RESERVED_FLAGS: u8 = 0x07;

pub const PACKET_HEADER_SIZE: usize = 16;

/// The fixed 16-octet datagram header, big-endian, version in the high
/// nibble of the first octet.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PacketHeader {
    pub version: u8,
    pub flags: u8,
    /// Pre-shifted receive window.
    pub window: u16,
    pub payload_id: u32,
    pub ack_nak_id: u32,
    pub ank_id: u32,
}

impl PacketHeader {
    #[inline]
    pub fn new(flags: u8) -> PacketHeader {
        PacketHeader {
            version: PROTOCOL_VERSION,
            flags,
            window: 0,
            payload_id: 0,
            ack_nak_id: 0,
            ank_id: 0,
        }
    }

    #[inline]
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Packs the header. Returns the number of octets written.
    pub fn pack<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<usize> {
        if stream.free_capacity() < PACKET_HEADER_SIZE {
            return Err(NetworkError::Wait);
        }

        stream.write_u8(self.version << 4)?;
        stream.write_u8(self.flags)?;
        stream.write_u16::<BigEndian>(self.window)?;
        stream.write_u32::<BigEndian>(self.payload_id)?;
        stream.write_u32::<BigEndian>(self.ack_nak_id)?;
        stream.write_u32::<BigEndian>(self.ank_id)?;

        Ok(PACKET_HEADER_SIZE)
    }

    /// Parses and validates a header. A wrong version or a reserved flag
    /// bit makes the whole datagram droppable.
    pub fn unpack(buffer: &[u8]) -> NetworkResult<PacketHeader> {
        if buffer.len() < PACKET_HEADER_SIZE {
            return Err(NetworkError::Fatal(ErrorType::BufferTooSmall));
        }

        let version = buffer[0] >> 4;
        if version != PROTOCOL_VERSION {
            return Err(NetworkError::Fatal(ErrorType::BadVersion));
        }

        let flags = buffer[1];
        if flags & RESERVED_FLAGS != 0 {
            return Err(NetworkError::Fatal(ErrorType::BadFlags));
        }

        let mut stream = Cursor::new(&buffer[2..PACKET_HEADER_SIZE]);

        Ok(PacketHeader {
            version,
            flags,
            window: stream.read_u16::<BigEndian>()?,
            payload_id: stream.read_u32::<BigEndian>()?,
            ack_nak_id: stream.read_u32::<BigEndian>()?,
            ank_id: stream.read_u32::<BigEndian>()?,
        })
    }
}

/// In-memory form of one datagram: header, system commands, then the node
/// command stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    pub sys_cmds: Vec<SysCmd>,
    pub node_cmds: Vec<NodeCmd>,
}

impl Packet {
    #[inline]
    pub fn new(flags: u8) -> Packet {
        Packet {
            header: PacketHeader::new(flags),
            sys_cmds: Vec::new(),
            node_cmds: Vec::new(),
        }
    }

    /// Parses a whole datagram. Octets left behind by a malformed trailing
    /// command are reported as corrupt but do not fail the packet.
    pub fn unpack(buffer: &[u8]) -> NetworkResult<(Packet, usize)> {
        let header = PacketHeader::unpack(buffer)?;

        let (sys_cmds, sys_len) = sys::unpack_sys_cmds(&buffer[PACKET_HEADER_SIZE..]);

        let body = &buffer[PACKET_HEADER_SIZE + sys_len..];
        let (node_cmds, body_len) = node::unpack_body(body);

        let corrupt = body.len() - body_len;

        Ok((
            Packet {
                header,
                sys_cmds,
                node_cmds,
            },
            corrupt,
        ))
    }

    /// Packs the header and the system commands; node commands follow as
    /// single-command groups. The datagram scheduler does its own body
    /// packing with compression and budgets; this form serves handshake
    /// packets and tests.
    pub fn pack<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<usize> {
        debug_assert!(self.sys_cmds.len() <= MAX_SYSTEM_COMMAND_COUNT);

        let mut written = self.header.pack(stream)?;

        for cmd in &self.sys_cmds {
            written += cmd.pack(stream)?;
        }

        for cmd in &self.node_cmds {
            written += node::pack_group(stream, std::slice::from_ref(cmd), 0)?;
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::sys::Negotiate;
    use crate::negotiate::FTR_TOKEN;

    #[test]
    fn test_header_roundtrip() {
        let header = PacketHeader {
            version: PROTOCOL_VERSION,
            flags: PAY_FLAG | ACK_FLAG | ANK_FLAG,
            window: 0xFFFF,
            payload_id: 0x0102_0304,
            ack_nak_id: 7,
            ank_id: 3,
        };

        let mut buffer = [0u8; PACKET_HEADER_SIZE];
        {
            let mut stream = Cursor::new(&mut buffer[..]);
            assert_eq!(header.pack(&mut stream).unwrap(), PACKET_HEADER_SIZE);
        }

        assert_eq!(buffer[0], 0x10);
        assert_eq!(buffer[1], 0xE0);
        assert_eq!(PacketHeader::unpack(&buffer).unwrap(), header);
    }

    #[test]
    fn test_bad_version_dropped() {
        let mut buffer = [0u8; PACKET_HEADER_SIZE];
        buffer[0] = 0x20;

        assert_eq!(
            PacketHeader::unpack(&buffer).unwrap_err(),
            NetworkError::Fatal(ErrorType::BadVersion)
        );
    }

    #[test]
    fn test_reserved_flags_dropped() {
        let mut buffer = [0u8; PACKET_HEADER_SIZE];
        buffer[0] = 0x10;
        buffer[1] = PAY_FLAG | 0x01;

        assert_eq!(
            PacketHeader::unpack(&buffer).unwrap_err(),
            NetworkError::Fatal(ErrorType::BadFlags)
        );
    }

    #[test]
    fn test_short_buffer_dropped() {
        let buffer = [0x10u8; PACKET_HEADER_SIZE - 1];

        assert_eq!(
            PacketHeader::unpack(&buffer).unwrap_err(),
            NetworkError::Fatal(ErrorType::BufferTooSmall)
        );
    }

    #[test]
    fn test_packet_roundtrip_with_commands() {
        let mut packet = Packet::new(PAY_FLAG | SYN_FLAG);
        packet.header.payload_id = 42;
        packet.sys_cmds.push(SysCmd::ChangeL(Negotiate::string8(FTR_TOKEN, &["abcdefghijklmnop"])));
        packet.node_cmds.push(NodeCmd::new(40, vec![1, 2], vec![3, 4]));

        let mut buffer = [0u8; 256];
        let written;
        {
            let mut stream = Cursor::new(&mut buffer[..]);
            written = packet.pack(&mut stream).unwrap();
        }

        let (parsed, corrupt) = Packet::unpack(&buffer[..written]).unwrap();

        assert_eq!(corrupt, 0);
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_pure_ack_packet_has_zero_payload_id() {
        let mut packet = Packet::new(ACK_FLAG | ANK_FLAG);
        packet.sys_cmds.push(SysCmd::Ack { pay_id: 11 });

        let mut buffer = [0u8; 64];
        let written;
        {
            let mut stream = Cursor::new(&mut buffer[..]);
            written = packet.pack(&mut stream).unwrap();
        }

        let (parsed, _) = Packet::unpack(&buffer[..written]).unwrap();

        assert_eq!(parsed.header.payload_id, 0);
        assert!(!parsed.header.has(PAY_FLAG));
    }
}
