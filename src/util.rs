use std::io::{Error, ErrorKind, Result};
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};

pub fn resolve_dest_v4(dest: &str) -> Result<Ipv4Addr> {
    let addrs = format!("{}:0", dest).to_socket_addrs()?;

    for addr in addrs {
        if let IpAddr::V4(v4) = addr.ip() {
            return Ok(v4);
        }
    }

    Err(Error::new(
        ErrorKind::AddrNotAvailable,
        "no IPv4 address for destination",
    ))
}

#[allow(clippy::double_parens)] // For stylistic reasons
pub fn set_checksum(data: &mut [u8], location: usize) {
    let sum = get_checksum(data, location);
    data[location*2    ] = ((sum & 0xFF00) >> 8) as u8;
    data[location*2 + 1] = ((sum & 0x00FF)     ) as u8;
}

pub fn get_checksum(data: &[u8], location: usize) -> u16 {
    let mut sum = sum_be_words(data, Some(location));
    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xFFFF);
    }

    !sum as u16 // The checksum field should be the ones complement of the sum
}

/// ICMP self-verification law: summing every word of a checksummed message,
/// checksum field included, must fold to 0xFFFF.
pub fn verify_checksum(data: &[u8]) -> bool {
    let mut sum = sum_be_words(data, None);
    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xFFFF);
    }

    sum as u16 == 0xFFFF
}

/// Sum all words (16 bit chunks) in the given data. The word at word offset
/// `skipword` (if any) will be skipped. Each word is treated as big endian.
fn sum_be_words(data: &[u8], skipword: Option<usize>) -> u32 {
    let skipword = skipword.map(|w| std::cmp::min(w, data.len() / 2 - 1));
    data.chunks(2)
        .map(|word| match *word {
            [w] => w as u16,
            [wh, wl] => u16::from_be_bytes([wh, wl]),
            _ => unreachable!(),
        })
        .enumerate()
        .filter_map(|(i, w)| if Some(i) == skipword { None } else { Some(w as u32) })
        .fold(0, u32::wrapping_add)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_self_verifies() {
        let mut data = [0x08, 0x00, 0x00, 0x00, 0xBE, 0xEF, 0x00, 0x01];
        set_checksum(&mut data, 1);
        assert!(verify_checksum(&data));
    }

    #[test]
    fn corrupted_word_fails_verification() {
        let mut data = [0x08, 0x00, 0x00, 0x00, 0xBE, 0xEF, 0x00, 0x01];
        set_checksum(&mut data, 1);
        data[5] ^= 0x40;
        assert!(!verify_checksum(&data));
    }

    #[test]
    fn all_ones_payload_folds_carries() {
        let mut data = [0xFF; 12];
        data[2] = 0;
        data[3] = 0;
        set_checksum(&mut data, 1);
        assert!(verify_checksum(&data));
    }

    #[test]
    fn resolves_dotted_quad() {
        let addr = resolve_dest_v4("127.0.0.1").unwrap();
        assert_eq!(addr, Ipv4Addr::new(127, 0, 0, 1));
    }

    #[test]
    fn rejects_garbage_destination() {
        assert!(resolve_dest_v4("not a host name").is_err());
    }

    #[test]
    fn rejects_empty_destination() {
        assert!(resolve_dest_v4("").is_err());
    }
}
