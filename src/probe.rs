use std::error::Error;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use dns_lookup::lookup_addr;
use socket2::{Domain, Protocol, SockAddr, Socket};

use crate::packet::{self, EchoReply, ParseError};
use crate::util;

// Large enough for any realistic echo reply plus its IP header.
const RECV_BUFFER_LEN: usize = 1500;

#[derive(Debug)]
pub enum ProbeError {
    Resolution(io::Error),
    Encoding(bincode::Error),
    Socket(io::Error),
    Transport(io::Error),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Resolution(e) => write!(f, "Error resolving destination: {}", e),
            ProbeError::Encoding(e) => write!(f, "Error encoding echo request: {}", e),
            ProbeError::Socket(e) => write!(f, "Error opening raw ICMP socket: {}", e),
            ProbeError::Transport(e) => write!(f, "Error on raw ICMP socket: {}", e),
        }
    }
}

impl Error for ProbeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ProbeError::Resolution(e) => Some(e),
            ProbeError::Encoding(e) => Some(e),
            ProbeError::Socket(e) => Some(e),
            ProbeError::Transport(e) => Some(e),
        }
    }
}

pub struct ProbeResult {
    pub address: Ipv4Addr,
    pub hostname: Option<String>,

    pub sequence: u16,
    pub size: u16, // Reply payload bytes (best effort, 0 if the reply was undecodable)
    pub rtt: Duration,
    pub timed_out: bool,
}

enum Verdict {
    Match(EchoReply),
    Foreign,
    Malformed(ParseError),
}

pub struct Probe {
    identifier: u16, // Used as 'identifier' word to match echo requests/replies
    coder: bincode::Config,
}

impl Probe {
    /// The identifier is fixed for the lifetime of the running process and
    /// passed in once, so every attempt tags its requests the same way.
    pub fn new(identifier: u16) -> Self {
        let mut coder = bincode::config();
        coder.big_endian(); // ICMP Packet Header uses big endian

        Probe { identifier, coder }
    }

    // Runs one echo request/reply exchange. The raw socket lives only for
    // the duration of this call and is closed on every exit path.
    pub fn probe(
        &self,
        destination: &str,
        sequence: u16,
        timeout: Duration,
    ) -> Result<ProbeResult, ProbeError> {
        // Resolve before touching the transport, so a bad name never opens
        // a socket or sends a byte.
        let address = util::resolve_dest_v4(destination).map_err(ProbeError::Resolution)?;

        let wire = packet::encode_request(&self.coder, self.identifier, sequence)
            .map_err(ProbeError::Encoding)?;

        let stype = socket2::Type::raw().cloexec();
        let socket = Socket::new(Domain::ipv4(), stype, Some(Protocol::icmpv4()))
            .map_err(ProbeError::Socket)?;
        let sock_addr = SockAddr::from(SocketAddr::from((IpAddr::V4(address), 0)));

        let begin = Instant::now();
        socket.send_to(&wire, &sock_addr).map_err(ProbeError::Transport)?;

        self.await_reply(&socket, address, sequence, begin, timeout)
    }

    // Waits for the matching echo reply, never past `begin + timeout`. A
    // silent destination yields a timed-out result instead of hanging.
    fn await_reply(
        &self,
        socket: &Socket,
        address: Ipv4Addr,
        sequence: u16,
        begin: Instant,
        timeout: Duration,
    ) -> Result<ProbeResult, ProbeError> {
        let deadline = begin + timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(self.expired(address, sequence, now - begin));
            }

            // A sub-millisecond remainder could truncate to a zero timeval,
            // which the kernel reads as "no timeout".
            let remaining = std::cmp::max(deadline - now, Duration::from_millis(1));
            socket
                .set_read_timeout(Some(remaining))
                .map_err(ProbeError::Socket)?;

            let mut buf = [0; RECV_BUFFER_LEN]; // We want the buffer to be fresh every time
            let (received, from) = match socket.recv_from(&mut buf[..]) {
                Ok(r) => r,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(self.expired(address, sequence, begin.elapsed()));
                }
                Err(e) => return Err(ProbeError::Transport(e)),
            };

            match self.classify(&buf[..received], sequence) {
                Verdict::Match(reply) => {
                    let rtt = begin.elapsed();
                    let hostname = from
                        .as_std()
                        .and_then(|peer| lookup_addr(&peer.ip()).ok());

                    return Ok(ProbeResult {
                        address,
                        hostname,
                        sequence,
                        size: reply.payload.len() as u16,
                        rtt,
                        timed_out: exceeded(rtt, timeout),
                    });
                }

                // Some other conversation's traffic on the shared raw
                // socket; keep waiting within the deadline.
                Verdict::Foreign => continue,

                // Mangled bytes still complete the attempt with whatever we
                // have, rather than aborting the run.
                Verdict::Malformed(e) => {
                    eprintln!("warning: discarding undecodable datagram: {}", e);
                    let rtt = begin.elapsed();

                    return Ok(ProbeResult {
                        address,
                        hostname: None,
                        sequence,
                        size: 0,
                        rtt,
                        timed_out: exceeded(rtt, timeout),
                    });
                }
            }
        }
    }

    // Decides what an inbound datagram means for the attempt with the given
    // sequence number.
    fn classify(&self, datagram: &[u8], sequence: u16) -> Verdict {
        let reply = match packet::icmp_view(&self.coder, datagram)
            .and_then(|icmp| packet::parse_reply(&self.coder, icmp))
        {
            Ok(reply) => reply,
            Err(e) => return Verdict::Malformed(e),
        };

        if reply.message_type != packet::ECHO_REPLY_V4 {
            return Verdict::Foreign;
        }

        // Check that this is the reply we were looking for
        if reply.identifier != self.identifier || reply.sequence_num != sequence {
            return Verdict::Foreign;
        }

        Verdict::Match(reply)
    }

    fn expired(&self, address: Ipv4Addr, sequence: u16, rtt: Duration) -> ProbeResult {
        ProbeResult {
            address,
            hostname: None,
            sequence,
            size: 0,
            rtt,
            timed_out: true,
        }
    }
}

// Post-hoc budget comparison: elapsed exactly equal to the budget is on time.
pub fn exceeded(elapsed: Duration, timeout: Duration) -> bool {
    elapsed.as_millis() > timeout.as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{encode_message, ECHO_REPLY_V4, ECHO_REQUEST_V4};

    fn reply_datagram(probe: &Probe, message_type: u8, identifier: u16, sequence: u16) -> Vec<u8> {
        let icmp = encode_message(&probe.coder, message_type, identifier, sequence).unwrap();

        let ip = packet::IPv4Header {
            version_and_header_len: 0x45,
            type_of_service: 0,
            datagram_length: (20 + icmp.len()) as u16,
            ip_identifier: 0,
            flags_and_5frag_offset: 0,
            rest_of_frag_offset: 0,
            ttl: 64,
            protocol: 1,
            checksum: 0,
            source_ip: 0x7F00_0001,
            destination_ip: 0x7F00_0001,
        };

        let mut datagram = probe.coder.serialize(&ip).unwrap();
        datagram.extend_from_slice(&icmp);
        datagram
    }

    #[test]
    fn elapsed_equal_to_budget_is_on_time() {
        let budget = Duration::from_millis(1000);
        assert!(!exceeded(Duration::from_millis(1000), budget));
    }

    #[test]
    fn elapsed_over_budget_times_out() {
        let budget = Duration::from_millis(1000);
        assert!(exceeded(Duration::from_millis(1001), budget));
        assert!(!exceeded(Duration::from_millis(999), budget));
    }

    #[test]
    fn unresolvable_destination_fails_before_transport() {
        let probe = Probe::new(1);
        match probe.probe("definitely not a hostname", 0, Duration::from_millis(10)) {
            Err(ProbeError::Resolution(_)) => {}
            Err(other) => panic!("expected resolution failure, got {}", other),
            Ok(_) => panic!("expected resolution failure, got a result"),
        }
    }

    #[test]
    fn matching_reply_is_accepted() {
        let probe = Probe::new(0xBEEF);
        let datagram = reply_datagram(&probe, ECHO_REPLY_V4, 0xBEEF, 5);

        match probe.classify(&datagram, 5) {
            Verdict::Match(reply) => {
                assert_eq!(reply.payload, packet::ECHO_PAYLOAD);
                assert_eq!(reply.sequence_num, 5);
            }
            _ => panic!("expected the reply to match"),
        }
    }

    #[test]
    fn foreign_identifier_is_ignored() {
        let probe = Probe::new(0xBEEF);
        let datagram = reply_datagram(&probe, ECHO_REPLY_V4, 0xCAFE, 5);

        match probe.classify(&datagram, 5) {
            Verdict::Foreign => {}
            _ => panic!("expected foreign traffic to be ignored"),
        }
    }

    #[test]
    fn stale_sequence_is_ignored() {
        let probe = Probe::new(0xBEEF);
        let datagram = reply_datagram(&probe, ECHO_REPLY_V4, 0xBEEF, 4);

        match probe.classify(&datagram, 5) {
            Verdict::Foreign => {}
            _ => panic!("expected a stale sequence to be ignored"),
        }
    }

    #[test]
    fn own_request_echoed_back_is_ignored() {
        // A raw ICMP socket on loopback sees our own outbound request too.
        let probe = Probe::new(0xBEEF);
        let datagram = reply_datagram(&probe, ECHO_REQUEST_V4, 0xBEEF, 5);

        match probe.classify(&datagram, 5) {
            Verdict::Foreign => {}
            _ => panic!("expected our own request to be ignored"),
        }
    }

    #[test]
    #[ignore] // Raw sockets need root, and loopback must answer ICMP echo
    fn loopback_probe_round_trips() {
        let probe = Probe::new(0x5AFE);
        let result = probe
            .probe("127.0.0.1", 0, Duration::from_millis(5000))
            .unwrap();

        assert_eq!(result.address, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(result.size as usize, packet::ECHO_PAYLOAD.len());
        assert!(!result.timed_out);
        assert!(result.rtt < Duration::from_millis(5000));
    }

    #[test]
    fn garbage_is_reported_malformed() {
        let probe = Probe::new(0xBEEF);
        let garbage = [0xA5; 48];

        match probe.classify(&garbage, 0) {
            Verdict::Malformed(_) => {}
            _ => panic!("expected garbage to be malformed"),
        }
    }
}
