use crate::cmd::sys::MIN_NODE_CMD_ID;
use crate::error::{ErrorType, NetworkError, NetworkResult};
use crate::wire::codec;
use crate::wire::{SizedRead, SizedWrite};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

/// Priority assigned to commands that do not ask for anything else.
pub const DEFAULT_PRIORITY: u8 = 128;

/// A node/tag/layer command as the core sees it: a family id, an address
/// whose equality marks two commands as overwriting the same target, and an
/// opaque payload. The scene semantics stay with the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCmd {
    pub id: u8,
    pub addr: Vec<u8>,
    pub data: Vec<u8>,
    pub prio: u8,
}

impl NodeCmd {
    #[inline]
    pub fn new(id: u8, addr: Vec<u8>, data: Vec<u8>) -> NodeCmd {
        debug_assert!(id >= MIN_NODE_CMD_ID);
        NodeCmd {
            id,
            addr,
            data,
            prio: DEFAULT_PRIORITY,
        }
    }

    #[inline]
    pub fn with_priority(id: u8, addr: Vec<u8>, data: Vec<u8>, prio: u8) -> NodeCmd {
        let mut cmd = NodeCmd::new(id, addr, data);
        cmd.prio = prio;
        cmd
    }

    /// Commands with an empty address never overwrite each other.
    #[inline]
    pub fn coalesces(&self) -> bool {
        !self.addr.is_empty()
    }

    /// Wire size of this command packed alone (share 0, group of one).
    #[inline]
    pub fn wire_len(&self) -> usize {
        group_wire_len(&[self.clone()], 0)
    }
}

/// Fixed octets of a group after the id and the length field: addr_len,
/// share, data_len.
const GROUP_FIXED: usize = 1 + 1 + 2;

/// Wire size of a group of commands sharing `share` leading address octets.
pub fn group_wire_len(cmds: &[NodeCmd], share: u8) -> usize {
    let addr_len = cmds[0].addr.len();
    let data_len = cmds[0].data.len();
    let suffix = addr_len - usize::from(share);

    let body = GROUP_FIXED + usize::from(share) + cmds.len() * (suffix + data_len);

    codec::cmd_total_len(body)
}

/// Longest address prefix common to every command of the run.
pub fn shared_prefix(cmds: &[NodeCmd]) -> u8 {
    let first = match cmds.first() {
        Some(cmd) => &cmd.addr,
        None => return 0,
    };

    let mut share = first.len();

    for cmd in &cmds[1..] {
        let mut common = 0;
        while common < share && cmd.addr[common] == first[common] {
            common += 1;
        }
        share = common;
    }

    share as u8
}

/// True when `next` may join a group led by `head`: same family, same
/// address and payload sizes. Uniform record sizes keep the group
/// self-describing on the wire.
#[inline]
pub fn groupable(head: &NodeCmd, next: &NodeCmd) -> bool {
    head.id == next.id && head.addr.len() == next.addr.len() && head.data.len() == next.data.len()
}

/// Packs a run of commands as one group: id, total length, addr_len, share,
/// data_len, the shared address prefix once, then each command's unshared
/// address suffix and payload. A run of one with share 0 is the
/// uncompressed form. Returns the number of octets written.
pub fn pack_group<W: SizedWrite>(stream: &mut W, cmds: &[NodeCmd], share: u8) -> NetworkResult<usize> {
    let head = match cmds.first() {
        Some(head) => head,
        None => return Err(NetworkError::Wait),
    };

    debug_assert!(cmds.iter().all(|cmd| groupable(head, cmd)));
    debug_assert!(usize::from(share) <= head.addr.len());

    let total = group_wire_len(cmds, share);

    if total > u16::max_value() as usize {
        return Err(NetworkError::Fatal(ErrorType::CommandTooLarge));
    }
    if stream.free_capacity() < total {
        return Err(NetworkError::Wait);
    }

    stream.write_u8(head.id)?;
    codec::pack_cmd_len(stream, total)?;
    stream.write_u8(head.addr.len() as u8)?;
    stream.write_u8(share)?;
    stream.write_u16::<BigEndian>(head.data.len() as u16)?;
    stream.write_all(&head.addr[..usize::from(share)])?;

    for cmd in cmds {
        stream.write_all(&cmd.addr[usize::from(share)..])?;
        stream.write_all(&cmd.data)?;
    }

    Ok(total)
}

/// Unpacks one group starting at `buffer[0]`. Returns the commands and the
/// octets consumed.
pub fn unpack_group(buffer: &[u8]) -> NetworkResult<(Vec<NodeCmd>, usize)> {
    if buffer.len() < 2 {
        return Err(NetworkError::Fatal(ErrorType::BufferTooSmall));
    }

    let id = buffer[0];

    if id < MIN_NODE_CMD_ID {
        return Err(NetworkError::Fatal(ErrorType::BadLength));
    }

    let mut stream = Cursor::new(&buffer[1..]);
    let (total, framing) = codec::unpack_cmd_len(&mut stream)?;

    if total > buffer.len() || total < 1 + framing + GROUP_FIXED {
        return Err(NetworkError::Fatal(ErrorType::BadLength));
    }

    let body = &buffer[1 + framing..total];
    let mut stream = Cursor::new(body);

    let addr_len = usize::from(stream.read_u8()?);
    let share = usize::from(stream.read_u8()?);
    let data_len = usize::from(stream.read_u16::<BigEndian>()?);

    if share > addr_len {
        return Err(NetworkError::Fatal(ErrorType::BadLength));
    }

    let suffix = addr_len - share;
    let record = suffix + data_len;
    let rest = body.len() - GROUP_FIXED;

    if rest < share {
        return Err(NetworkError::Fatal(ErrorType::BadLength));
    }

    let members = rest - share;

    if record == 0 || members == 0 || members % record != 0 {
        return Err(NetworkError::Fatal(ErrorType::BadLength));
    }

    let mut prefix = vec![0u8; share];
    stream.read_exact(&mut prefix)?;

    let mut cmds = Vec::with_capacity(members / record);

    for _ in 0..members / record {
        let mut addr = prefix.clone();
        addr.resize(addr_len, 0);
        stream.read_exact(&mut addr[share..])?;

        let mut data = vec![0u8; data_len];
        stream.read_exact(&mut data)?;

        cmds.push(NodeCmd::new(id, addr, data));
    }

    Ok((cmds, total))
}

/// Parses the node-command body of a datagram: group after group until the
/// buffer is exhausted. A malformed group ends parsing; the caller compares
/// the consumed count against the body length to spot corruption.
pub fn unpack_body(buffer: &[u8]) -> (Vec<NodeCmd>, usize) {
    let mut cmds = Vec::new();
    let mut pos = 0usize;

    while pos < buffer.len() {
        match unpack_group(&buffer[pos..]) {
            Ok((group, consumed)) => {
                cmds.extend(group);
                pos += consumed;
            }
            Err(_) => break,
        }
    }

    (cmds, pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(id: u8, addr: &[u8], data: &[u8]) -> NodeCmd {
        NodeCmd::new(id, addr.to_vec(), data.to_vec())
    }

    #[test]
    fn test_single_roundtrip() {
        let single = cmd(40, &[0, 0, 1, 7], &[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut buffer = [0u8; 128];
        let written;
        {
            let mut stream = Cursor::new(&mut buffer[..]);
            written = pack_group(&mut stream, &[single.clone()], 0).unwrap();
        }

        let (parsed, consumed) = unpack_group(&buffer[..written]).unwrap();

        assert_eq!(consumed, written);
        assert_eq!(parsed, vec![single]);
    }

    #[test]
    fn test_share_roundtrip_preserves_order() {
        let run = vec![
            cmd(40, &[9, 9, 0, 1], &[0xAA, 0xAB]),
            cmd(40, &[9, 9, 0, 2], &[0xBA, 0xBB]),
            cmd(40, &[9, 9, 1, 0], &[0xCA, 0xCB]),
        ];

        let share = shared_prefix(&run);
        assert_eq!(share, 2);

        let mut buffer = [0u8; 128];
        let written;
        {
            let mut stream = Cursor::new(&mut buffer[..]);
            written = pack_group(&mut stream, &run, share).unwrap();
        }

        let (parsed, consumed) = unpack_group(&buffer[..written]).unwrap();

        assert_eq!(consumed, written);
        assert_eq!(parsed, run);
    }

    #[test]
    fn test_share_saves_octets() {
        let run = vec![
            cmd(50, &[1, 2, 3, 4, 5, 6, 1], &[7]),
            cmd(50, &[1, 2, 3, 4, 5, 6, 2], &[8]),
            cmd(50, &[1, 2, 3, 4, 5, 6, 3], &[9]),
        ];

        let shared = group_wire_len(&run, 6);
        let plain: usize = run.iter().map(NodeCmd::wire_len).sum();

        assert!(shared < plain);
    }

    #[test]
    fn test_empty_address_group() {
        let lone = cmd(60, &[], &[1, 2, 3]);
        assert!(!lone.coalesces());

        let mut buffer = [0u8; 64];
        let written;
        {
            let mut stream = Cursor::new(&mut buffer[..]);
            written = pack_group(&mut stream, &[lone.clone()], 0).unwrap();
        }

        let (parsed, _) = unpack_group(&buffer[..written]).unwrap();
        assert_eq!(parsed, vec![lone]);
    }

    #[test]
    fn test_body_with_mixed_groups() {
        let mut buffer = [0u8; 256];
        let a = cmd(40, &[1, 1], &[1]);
        let b = vec![cmd(41, &[2, 1], &[2, 2]), cmd(41, &[2, 2], &[2, 3])];

        let mut written = 0;
        {
            let mut stream = Cursor::new(&mut buffer[..]);
            written += pack_group(&mut stream, &[a.clone()], 0).unwrap();
            written += pack_group(&mut stream, &b, 1).unwrap();
        }

        let (parsed, consumed) = unpack_body(&buffer[..written]);

        assert_eq!(consumed, written);
        assert_eq!(parsed, vec![a, b[0].clone(), b[1].clone()]);
    }

    #[test]
    fn test_truncated_group_rejected() {
        let one = cmd(40, &[1, 2, 3], &[4, 5, 6]);

        let mut buffer = [0u8; 64];
        let written;
        {
            let mut stream = Cursor::new(&mut buffer[..]);
            written = pack_group(&mut stream, &[one], 0).unwrap();
        }

        assert!(unpack_group(&buffer[..written - 1]).is_err());
    }

    #[test]
    fn test_bad_share_rejected() {
        // share larger than addr_len.
        let buffer = [40u8, 8, 1, 2, 0, 1, 0, 9];
        assert!(unpack_group(&buffer).is_err());
    }

    #[test]
    fn test_shared_prefix_computation() {
        let run = vec![cmd(40, &[1, 2, 3], &[]), cmd(40, &[1, 2, 9], &[])];
        assert_eq!(shared_prefix(&run), 2);

        let run = vec![cmd(40, &[1], &[]), cmd(40, &[2], &[])];
        assert_eq!(shared_prefix(&run), 0);
    }
}
