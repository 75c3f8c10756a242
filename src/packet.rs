use std::error::Error;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::util;

pub const ECHO_REQUEST_V4: u8 = 8;
pub const ECHO_REPLY_V4: u8 = 0;
pub const ICMP_HEADER_LEN: usize = 8;

/// Fixed identifying payload carried by every outgoing echo request.
pub const ECHO_PAYLOAD: &[u8] = b"echoprobe diagnostic payload";

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct ICMPEchoHeader {
    pub message_type: u8,
    pub message_code: u8,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence_num: u16,
}

#[derive(Serialize, Deserialize)]
pub struct IPv4Header {
    pub version_and_header_len: u8,
    pub type_of_service: u8,
    pub datagram_length: u16,
    pub ip_identifier: u16,
    pub flags_and_5frag_offset: u8, // flags are u3
    pub rest_of_frag_offset: u8,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source_ip: u32,
    pub destination_ip: u32,
}

/// An inbound ICMP message pulled off the raw socket.
#[derive(Debug)]
pub struct EchoReply {
    pub message_type: u8,
    pub message_code: u8,
    pub identifier: u16,
    pub sequence_num: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub enum ParseError {
    Truncated,
    BadChecksum,
    Decode(bincode::Error),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Truncated => write!(f, "datagram too short for an ICMP message"),
            ParseError::BadChecksum => write!(f, "ICMP checksum mismatch"),
            ParseError::Decode(e) => write!(f, "undecodable header: {}", e),
        }
    }
}

impl Error for ParseError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ParseError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

pub fn encode_message(
    coder: &bincode::Config,
    message_type: u8,
    identifier: u16,
    sequence_num: u16,
) -> bincode::Result<Vec<u8>> {
    let header = ICMPEchoHeader {
        message_type,
        message_code: 0,
        checksum: 0,
        identifier,
        sequence_num,
    };

    let mut wire = coder.serialize(&header)?;
    wire.extend_from_slice(ECHO_PAYLOAD);
    util::set_checksum(&mut wire, 1); // Checksum occupies the second header word
    Ok(wire)
}

pub fn encode_request(
    coder: &bincode::Config,
    identifier: u16,
    sequence_num: u16,
) -> bincode::Result<Vec<u8>> {
    encode_message(coder, ECHO_REQUEST_V4, identifier, sequence_num)
}

/// Locates the ICMP portion of a raw IPv4 datagram. The kernel hands us the
/// whole IP packet, so the echo message starts after the variable-length
/// IP header.
pub fn icmp_view<'a>(coder: &bincode::Config, datagram: &'a [u8]) -> Result<&'a [u8], ParseError> {
    let ip_packet = coder
        .deserialize::<IPv4Header>(datagram)
        .map_err(ParseError::Decode)?;

    // Get the 'header length' portion of the u8, which is encoded as u8/4 (bits/32)
    let data_offset = 4 * (ip_packet.version_and_header_len & 0x0F) as usize;
    if data_offset == 0 || datagram.len() < data_offset + ICMP_HEADER_LEN {
        return Err(ParseError::Truncated);
    }

    Ok(&datagram[data_offset..])
}

pub fn parse_reply(coder: &bincode::Config, icmp: &[u8]) -> Result<EchoReply, ParseError> {
    if icmp.len() < ICMP_HEADER_LEN {
        return Err(ParseError::Truncated);
    }
    if !util::verify_checksum(icmp) {
        return Err(ParseError::BadChecksum);
    }

    let header = coder
        .deserialize::<ICMPEchoHeader>(icmp)
        .map_err(ParseError::Decode)?;

    Ok(EchoReply {
        message_type: header.message_type,
        message_code: header.message_code,
        identifier: header.identifier,
        sequence_num: header.sequence_num,
        payload: icmp[ICMP_HEADER_LEN..].to_vec(),
    })
}
