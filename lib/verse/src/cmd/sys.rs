use crate::error::{ErrorType, NetworkError, NetworkResult};
use crate::negotiate::{self, ValueKind};
use crate::wire::codec;
use crate::wire::{SizedRead, SizedWrite};
use crate::MAX_SYSTEM_COMMAND_COUNT;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

pub const CMD_RESERVED_ID: u8 = 0;
pub const CMD_ACK_ID: u8 = 1;
pub const CMD_NAK_ID: u8 = 2;
pub const CMD_CHANGE_L_ID: u8 = 3;
pub const CMD_CHANGE_R_ID: u8 = 4;
pub const CMD_CONFIRM_L_ID: u8 = 5;
pub const CMD_CONFIRM_R_ID: u8 = 6;
pub const CMD_USER_AUTH_REQUEST_ID: u8 = 7;
pub const CMD_USER_AUTH_FAILURE_ID: u8 = 8;
pub const CMD_USER_AUTH_SUCCESS_ID: u8 = 9;

/// Highest id of the system-command range; 32 and above is the node stream.
pub const MAX_SYS_CMD_ID: u8 = 31;
pub const MIN_NODE_CMD_ID: u8 = 32;

/// User authentication methods.
pub const UA_METHOD_RESERVED: u8 = 0;
pub const UA_METHOD_NONE: u8 = 1;
pub const UA_METHOD_PASSWORD: u8 = 2;

/// At most this many values in one negotiate command.
pub const MAX_FTR_VALUE_COUNT: usize = 5;

/// Value list of a negotiate command, typed per the feature table.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    Uint8(Vec<u8>),
    Real32(Vec<f32>),
    String8(Vec<String>),
}

impl Values {
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Values::Uint8(v) => v.len(),
            Values::Real32(v) => v.len(),
            Values::String8(v) => v.len(),
        }
    }

    fn wire_len(&self) -> usize {
        match self {
            Values::Uint8(v) => v.len(),
            Values::Real32(v) => v.len() * 4,
            Values::String8(v) => v.iter().map(|s| codec::string8_len(s)).sum(),
        }
    }
}

/// A CHANGE_L/R or CONFIRM_L/R payload: feature id plus preference list.
/// An empty list is legal and means "propose nothing / confirm empty".
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiate {
    pub feature: u8,
    pub values: Values,
}

impl Negotiate {
    #[inline]
    pub fn uint8(feature: u8, values: &[u8]) -> Negotiate {
        Negotiate {
            feature,
            values: Values::Uint8(values.to_vec()),
        }
    }

    #[inline]
    pub fn real32(feature: u8, values: &[f32]) -> Negotiate {
        Negotiate {
            feature,
            values: Values::Real32(values.to_vec()),
        }
    }

    #[inline]
    pub fn string8(feature: u8, values: &[&str]) -> Negotiate {
        Negotiate {
            feature,
            values: Values::String8(values.iter().map(|s| (*s).to_owned()).collect()),
        }
    }

    /// First value, for the single-valued features.
    #[inline]
    pub fn first_uint8(&self) -> Option<u8> {
        match &self.values {
            Values::Uint8(v) => v.first().copied(),
            _ => None,
        }
    }

    #[inline]
    pub fn first_real32(&self) -> Option<f32> {
        match &self.values {
            Values::Real32(v) => v.first().copied(),
            _ => None,
        }
    }

    #[inline]
    pub fn first_string8(&self) -> Option<&str> {
        match &self.values {
            Values::String8(v) => v.first().map(|s| s.as_str()),
            _ => None,
        }
    }
}

/// The tagged union of every system command. Ids 10..=31 are reserved and
/// skipped on receipt.
#[derive(Debug, Clone, PartialEq)]
pub enum SysCmd {
    Ack { pay_id: u32 },
    Nak { pay_id: u32 },
    ChangeL(Negotiate),
    ChangeR(Negotiate),
    ConfirmL(Negotiate),
    ConfirmR(Negotiate),
    UserAuthRequest { username: String, method: u8, data: String },
    UserAuthFailure { methods: Vec<u8> },
    UserAuthSuccess { user_id: u16, avatar_id: u32 },
}

impl SysCmd {
    #[inline]
    pub fn id(&self) -> u8 {
        match self {
            SysCmd::Ack { .. } => CMD_ACK_ID,
            SysCmd::Nak { .. } => CMD_NAK_ID,
            SysCmd::ChangeL(_) => CMD_CHANGE_L_ID,
            SysCmd::ChangeR(_) => CMD_CHANGE_R_ID,
            SysCmd::ConfirmL(_) => CMD_CONFIRM_L_ID,
            SysCmd::ConfirmR(_) => CMD_CONFIRM_R_ID,
            SysCmd::UserAuthRequest { .. } => CMD_USER_AUTH_REQUEST_ID,
            SysCmd::UserAuthFailure { .. } => CMD_USER_AUTH_FAILURE_ID,
            SysCmd::UserAuthSuccess { .. } => CMD_USER_AUTH_SUCCESS_ID,
        }
    }

    /// Octets after the id and the length field. ACK and NAK carry no
    /// length field at all.
    fn data_len(&self) -> usize {
        match self {
            SysCmd::Ack { .. } | SysCmd::Nak { .. } => 4,
            SysCmd::ChangeL(n) | SysCmd::ChangeR(n) | SysCmd::ConfirmL(n) | SysCmd::ConfirmR(n) => {
                1 + n.values.wire_len()
            }
            SysCmd::UserAuthRequest { username, method, data } => {
                let mut len = codec::string8_len(username) + 1;
                if *method == UA_METHOD_PASSWORD {
                    len += codec::string8_len(data);
                }
                len
            }
            SysCmd::UserAuthFailure { methods } => methods.len(),
            SysCmd::UserAuthSuccess { .. } => 2 + 4,
        }
    }

    /// Total wire length of the command.
    #[inline]
    pub fn wire_len(&self) -> usize {
        match self {
            SysCmd::Ack { .. } | SysCmd::Nak { .. } => 1 + 4,
            _ => codec::cmd_total_len(self.data_len()),
        }
    }

    /// Packs the command. Returns the number of octets written.
    pub fn pack<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<usize> {
        if stream.free_capacity() < self.wire_len() {
            return Err(NetworkError::Wait);
        }

        match self {
            SysCmd::Ack { pay_id } | SysCmd::Nak { pay_id } => {
                stream.write_u8(self.id())?;
                stream.write_u32::<BigEndian>(*pay_id)?;
            }
            SysCmd::ChangeL(n) | SysCmd::ChangeR(n) | SysCmd::ConfirmL(n) | SysCmd::ConfirmR(n) => {
                if n.values.len() > MAX_FTR_VALUE_COUNT {
                    return Err(NetworkError::Fatal(ErrorType::CommandTooLarge));
                }
                stream.write_u8(self.id())?;
                codec::pack_cmd_len(stream, self.wire_len())?;
                stream.write_u8(n.feature)?;
                match &n.values {
                    Values::Uint8(values) => {
                        for &value in values {
                            stream.write_u8(value)?;
                        }
                    }
                    Values::Real32(values) => {
                        for &value in values {
                            stream.write_f32::<BigEndian>(value)?;
                        }
                    }
                    Values::String8(values) => {
                        for value in values {
                            codec::pack_string8(stream, value)?;
                        }
                    }
                }
            }
            SysCmd::UserAuthRequest { username, method, data } => {
                stream.write_u8(self.id())?;
                codec::pack_cmd_len(stream, self.wire_len())?;
                codec::pack_string8(stream, username)?;
                stream.write_u8(*method)?;
                if *method == UA_METHOD_PASSWORD {
                    codec::pack_string8(stream, data)?;
                }
            }
            SysCmd::UserAuthFailure { methods } => {
                stream.write_u8(self.id())?;
                codec::pack_cmd_len(stream, self.wire_len())?;
                for &method in methods {
                    stream.write_u8(method)?;
                }
            }
            SysCmd::UserAuthSuccess { user_id, avatar_id } => {
                stream.write_u8(self.id())?;
                codec::pack_cmd_len(stream, self.wire_len())?;
                stream.write_u16::<BigEndian>(*user_id)?;
                stream.write_u32::<BigEndian>(*avatar_id)?;
            }
        }

        Ok(self.wire_len())
    }
}

/// Parses the run of system commands at the start of `buffer`. Stops at the
/// first node-command id, at the command-count ceiling or at the end of the
/// buffer; a malformed command consumes the rest of the buffer so the caller
/// skips the remainder of the datagram.
///
/// Returns the parsed commands and the number of octets consumed.
pub fn unpack_sys_cmds(buffer: &[u8]) -> (Vec<SysCmd>, usize) {
    let mut cmds = Vec::new();
    let mut pos = 0usize;

    while pos < buffer.len() && cmds.len() < MAX_SYSTEM_COMMAND_COUNT {
        let id = buffer[pos];

        if id >= MIN_NODE_CMD_ID {
            break;
        }

        match unpack_one(id, &buffer[pos..]) {
            Ok((Some(cmd), consumed)) => {
                cmds.push(cmd);
                pos += consumed;
            }
            Ok((None, consumed)) => {
                // Reserved id skipped via its length octet.
                pos += consumed;
            }
            Err(_) => {
                pos = buffer.len();
                break;
            }
        }
    }

    (cmds, pos)
}

/// Parses one system command starting at `buffer[0]` (the id octet).
fn unpack_one(id: u8, buffer: &[u8]) -> NetworkResult<(Option<SysCmd>, usize)> {
    match id {
        CMD_ACK_ID | CMD_NAK_ID => {
            if buffer.len() < 5 {
                return Err(NetworkError::Fatal(ErrorType::BufferTooSmall));
            }
            let mut stream = Cursor::new(&buffer[1..5]);
            let pay_id = stream.read_u32::<BigEndian>()?;
            let cmd = if id == CMD_ACK_ID {
                SysCmd::Ack { pay_id }
            } else {
                SysCmd::Nak { pay_id }
            };
            Ok((Some(cmd), 5))
        }
        CMD_CHANGE_L_ID | CMD_CHANGE_R_ID | CMD_CONFIRM_L_ID | CMD_CONFIRM_R_ID => {
            let (total, body) = framed_body(buffer)?;
            let negotiate = unpack_negotiate(body)?;
            let cmd = match id {
                CMD_CHANGE_L_ID => SysCmd::ChangeL(negotiate),
                CMD_CHANGE_R_ID => SysCmd::ChangeR(negotiate),
                CMD_CONFIRM_L_ID => SysCmd::ConfirmL(negotiate),
                _ => SysCmd::ConfirmR(negotiate),
            };
            Ok((Some(cmd), total))
        }
        CMD_USER_AUTH_REQUEST_ID => {
            let (total, body) = framed_body(buffer)?;
            let mut stream = Cursor::new(body);
            let username = codec::unpack_string8(&mut stream)?;
            if stream.remaining_data() < 1 {
                return Err(NetworkError::Fatal(ErrorType::BadLength));
            }
            let method = stream.read_u8()?;
            let data = if method == UA_METHOD_PASSWORD && stream.remaining_data() > 0 {
                codec::unpack_string8(&mut stream)?
            } else {
                String::new()
            };
            Ok((Some(SysCmd::UserAuthRequest { username, method, data }), total))
        }
        CMD_USER_AUTH_FAILURE_ID => {
            let (total, body) = framed_body(buffer)?;
            Ok((Some(SysCmd::UserAuthFailure { methods: body.to_vec() }), total))
        }
        CMD_USER_AUTH_SUCCESS_ID => {
            let (total, body) = framed_body(buffer)?;
            if body.len() < 6 {
                return Err(NetworkError::Fatal(ErrorType::BadLength));
            }
            let mut stream = Cursor::new(body);
            let user_id = stream.read_u16::<BigEndian>()?;
            let avatar_id = stream.read_u32::<BigEndian>()?;
            Ok((Some(SysCmd::UserAuthSuccess { user_id, avatar_id }), total))
        }
        _ => {
            // Reserved range: advance over the announced length.
            let (total, _) = framed_body(buffer)?;
            Ok((None, total))
        }
    }
}

/// Splits a length-framed command into (total length, body after framing),
/// validating the announced length against the buffer.
fn framed_body(buffer: &[u8]) -> NetworkResult<(usize, &[u8])> {
    let mut stream = Cursor::new(&buffer[1..]);
    let (total, framing) = codec::unpack_cmd_len(&mut stream)?;

    if total < 1 + framing || total > buffer.len() {
        return Err(NetworkError::Fatal(ErrorType::BadLength));
    }

    Ok((total, &buffer[1 + framing..total]))
}

/// Decodes a negotiate body: feature id, then values whose count is derived
/// from the remaining length and the feature's value type.
fn unpack_negotiate(body: &[u8]) -> NetworkResult<Negotiate> {
    if body.is_empty() {
        return Err(NetworkError::Fatal(ErrorType::BadLength));
    }

    let feature = body[0];
    let raw = &body[1..];

    let values = match negotiate::value_kind(feature) {
        ValueKind::Uint8 => {
            Values::Uint8(raw.iter().take(MAX_FTR_VALUE_COUNT).copied().collect())
        }
        ValueKind::Real32 => {
            if raw.len() % 4 != 0 {
                return Err(NetworkError::Fatal(ErrorType::BadLength));
            }
            let mut stream = Cursor::new(raw);
            let mut values = Vec::with_capacity(raw.len() / 4);
            while stream.remaining_data() >= 4 && values.len() < MAX_FTR_VALUE_COUNT {
                values.push(stream.read_f32::<BigEndian>()?);
            }
            Values::Real32(values)
        }
        ValueKind::String8 => {
            let mut stream = Cursor::new(raw);
            let mut values = Vec::new();
            while stream.remaining_data() > 0 && values.len() < MAX_FTR_VALUE_COUNT {
                values.push(codec::unpack_string8(&mut stream)?);
            }
            Values::String8(values)
        }
    };

    Ok(Negotiate { feature, values })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiate::{FTR_CC_ID, FTR_FPS, FTR_HOST_URL, FTR_TOKEN};

    fn roundtrip(cmd: SysCmd) {
        let mut buffer = [0u8; 512];
        let written;
        {
            let mut stream = Cursor::new(&mut buffer[..]);
            written = cmd.pack(&mut stream).unwrap();
        }

        assert_eq!(written, cmd.wire_len());

        let (cmds, consumed) = unpack_sys_cmds(&buffer[..written]);

        assert_eq!(consumed, written);
        assert_eq!(cmds, vec![cmd]);
    }

    #[test]
    fn test_ack_nak_roundtrip() {
        roundtrip(SysCmd::Ack { pay_id: 0xDEAD_BEEF });
        roundtrip(SysCmd::Nak { pay_id: 1 });
    }

    #[test]
    fn test_negotiate_roundtrip() {
        roundtrip(SysCmd::ChangeL(Negotiate::uint8(FTR_CC_ID, &[1, 2])));
        roundtrip(SysCmd::ChangeR(Negotiate::string8(FTR_HOST_URL, &["verse-udp-dtls://host:*"])));
        roundtrip(SysCmd::ConfirmL(Negotiate::real32(FTR_FPS, &[60.0])));
        roundtrip(SysCmd::ConfirmR(Negotiate::string8(FTR_TOKEN, &[])));
    }

    #[test]
    fn test_user_auth_roundtrip() {
        roundtrip(SysCmd::UserAuthRequest {
            username: "tester".to_owned(),
            method: UA_METHOD_NONE,
            data: String::new(),
        });
        roundtrip(SysCmd::UserAuthRequest {
            username: "tester".to_owned(),
            method: UA_METHOD_PASSWORD,
            data: "sw0rdfish".to_owned(),
        });
        roundtrip(SysCmd::UserAuthFailure { methods: vec![UA_METHOD_PASSWORD] });
        roundtrip(SysCmd::UserAuthSuccess { user_id: 1001, avatar_id: 74 });
    }

    #[test]
    fn test_command_sequence() {
        let cmds = vec![
            SysCmd::Ack { pay_id: 3 },
            SysCmd::Nak { pay_id: 4 },
            SysCmd::Ack { pay_id: 7 },
            SysCmd::ConfirmL(Negotiate::string8(FTR_TOKEN, &["0123456789abcdef"])),
        ];

        let mut buffer = [0u8; 256];
        let mut written = 0;
        {
            let mut stream = Cursor::new(&mut buffer[..]);
            for cmd in &cmds {
                written += cmd.pack(&mut stream).unwrap();
            }
        }

        let (parsed, consumed) = unpack_sys_cmds(&buffer[..written]);

        assert_eq!(consumed, written);
        assert_eq!(parsed, cmds);
    }

    #[test]
    fn test_parsing_stops_at_node_range() {
        let mut buffer = [0u8; 64];
        let written;
        {
            let mut stream = Cursor::new(&mut buffer[..]);
            written = SysCmd::Ack { pay_id: 9 }.pack(&mut stream).unwrap();
        }
        buffer[written] = MIN_NODE_CMD_ID;

        let (parsed, consumed) = unpack_sys_cmds(&buffer[..written + 1]);

        assert_eq!(parsed.len(), 1);
        assert_eq!(consumed, written);
    }

    #[test]
    fn test_unknown_reserved_id_is_skipped() {
        // id 20, length 4, two octets of opaque payload, then an ACK.
        let mut buffer = vec![20u8, 4, 0xAA, 0xBB];
        {
            let mut tail = [0u8; 8];
            let written;
            {
                let mut stream = Cursor::new(&mut tail[..]);
                written = SysCmd::Ack { pay_id: 5 }.pack(&mut stream).unwrap();
            }
            buffer.extend_from_slice(&tail[..written]);
        }

        let (parsed, consumed) = unpack_sys_cmds(&buffer);

        assert_eq!(parsed, vec![SysCmd::Ack { pay_id: 5 }]);
        assert_eq!(consumed, buffer.len());
    }

    #[test]
    fn test_truncated_command_consumes_rest() {
        // USER_AUTH_SUCCESS announcing more octets than the buffer holds.
        let buffer = [CMD_USER_AUTH_SUCCESS_ID, 8, 0, 1];

        let (parsed, consumed) = unpack_sys_cmds(&buffer);

        assert!(parsed.is_empty());
        assert_eq!(consumed, buffer.len());
    }

    #[test]
    fn test_negotiate_empty_value_list() {
        let cmd = SysCmd::ChangeL(Negotiate::uint8(FTR_CC_ID, &[]));
        assert_eq!(cmd.wire_len(), 3);
        roundtrip(cmd);
    }
}
