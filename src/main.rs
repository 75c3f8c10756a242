mod packet;
mod probe;
mod util;

use colored::*;

use clap::{App, AppSettings, Arg};

use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use probe::{Probe, ProbeResult};

fn main() {
    let matches = App::new("echoprobe")
        .setting(AppSettings::ColoredHelp)
        .version("v0.1.0")
        .about("Sends ICMPv4 echo requests to a host and reports per-reply round-trip latency.\nRaw sockets need elevated privilege, so run it with sudo.")
        .arg(Arg::with_name("DESTINATION")
            .help("Hostname or IPv4 address")
            .required(true)
            .index(1))
        .arg(Arg::with_name("timeout")
            .help("Per-probe timeout threshold in milliseconds (Default 1000)")
            .short("t")
            .takes_value(true))
        .arg(Arg::with_name("count")
            .help("Number of echo requests to issue (Default: keep going)")
            .short("c")
            .takes_value(true))
        .arg(Arg::with_name("interval")
            .help("Set how long to wait in between probes (Default 1s)")
            .short("i")
            .takes_value(true))
        .get_matches();

    let destination = matches.value_of("DESTINATION").unwrap();

    let timeout = matches.value_of("timeout").unwrap_or("1000");
    let timeout = Duration::from_millis(
        timeout.parse::<u64>().expect("Invalid timeout in milliseconds (ex: 500) : "));

    let count = matches.value_of("count")
        .map(|c| c.parse::<u64>().expect("Invalid count (ex: 10) : "))
        .unwrap_or(u64::MAX);

    let interval = matches.value_of("interval").unwrap_or("1s");
    let interval = humantime::parse_duration(interval).expect("Invalid duration for interval (ex: 1s, 400ms, 1m) : ");

    // One identifier for the whole run, fixed at startup and handed to the
    // probe explicitly.
    let identifier = (process::id() & 0xFFFF) as u16;
    let prober = Probe::new(identifier);

    println!("{} {}", "PING".cyan(), destination.bold());

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    }).expect("Error setting Ctrl-C handler");

    let mut failed = false;
    let sent = drive(count, interval, &running, |sequence| {
        match prober.probe(destination, sequence, timeout) {
            Ok(result) => {
                report(&result);
                if result.timed_out {
                    failed = true;
                }
                result.timed_out
            }
            Err(e) => {
                eprintln!("{}", e);
                failed = true;
                true
            }
        }
    });

    println!(""); // New line
    println!("{} {} {} {}", "===".yellow(), destination.bold(), "probe summary".cyan(), "===".yellow());
    println!("{} echo requests transmitted", sent.to_string().bold());

    if failed {
        process::exit(1);
    }
}

// The driver: issues up to `count` probe attempts, sleeping `interval`
// between consecutive ones. The attempt's sequence number is its index.
// A `true` from the attempt closure (timeout or fatal error) stops the run.
// Returns how many attempts were issued.
fn drive<F>(count: u64, interval: Duration, running: &AtomicBool, mut attempt: F) -> u64
where
    F: FnMut(u16) -> bool,
{
    let mut sent = 0;

    for i in 0..count {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        sent += 1;
        if attempt((i & 0xFFFF) as u16) {
            break;
        }

        if i + 1 < count {
            thread::sleep(interval);
        }
    }

    sent
}

fn report(result: &ProbeResult) {
    let host = result.hostname.clone().unwrap_or_else(|| result.address.to_string());

    println!("{} bytes from {} ({}): icmp_seq={} time={}ms",
        result.size, host.yellow(), result.address,
        result.sequence.to_string().bold(),
        format!("{:.2}", result.rtt.as_micros() as f32 / 1000f32).bold());

    if result.timed_out {
        println!("{}", "Operation timed out".red().bold());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_exhaustion_issues_exactly_count_attempts() {
        let running = AtomicBool::new(true);
        let mut sequences = Vec::new();

        let sent = drive(3, Duration::from_millis(0), &running, |seq| {
            sequences.push(seq);
            false
        });

        assert_eq!(sent, 3);
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn stop_signal_halts_the_run_early() {
        let running = AtomicBool::new(true);
        let mut calls = 0;

        let sent = drive(10, Duration::from_millis(0), &running, |_| {
            calls += 1;
            calls == 2 // Second attempt times out
        });

        assert_eq!(sent, 2);
        assert_eq!(calls, 2);
    }

    #[test]
    fn cleared_running_flag_prevents_attempts() {
        let running = AtomicBool::new(false);

        let sent = drive(10, Duration::from_millis(0), &running, |_| {
            panic!("no attempt should run")
        });

        assert_eq!(sent, 0);
    }
}
