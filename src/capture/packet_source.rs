// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Packet Source (external contract) — drives `tshark` or `tcpdump` as a
//! child process and normalizes both output formats to `(t, src, dst,
//! size)` tuples.
//!
//! Grounded in `original_source/utils/network.py` (`get_packet_analyzer`,
//! `format_packet`, `_get_cdn_ips`) for the exact command lines, field
//! layout, and CDN hostname patterns; the subprocess-plus-piped-stdout
//! shape follows the teacher's `camera.rs::supervised_connect`
//! style (spawn, supervise, restart once on death).

use std::net::IpAddr;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{info, warn};

use crate::config::{CaptureConfig, PacketBackend};
use crate::error::{IdError, Result};

/// One normalized packet observation.
#[derive(Debug, Clone, Copy)]
pub struct PacketLine {
    pub t: f64,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub size: i64,
}

/// Wraps a running `tshark`/`tcpdump` child process and yields normalized
/// packet lines.
pub struct PacketSource {
    backend: PacketBackend,
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

impl PacketSource {
    /// Spawn the configured backend against `interface` with capture
    /// filter `filter`.
    pub fn spawn(config: &CaptureConfig, filter: &str) -> Result<Self> {
        let mut command = match config.backend {
            PacketBackend::Tshark => {
                let mut c = Command::new("tshark");
                c.args([
                    "-i", &config.interface,
                    "-f", filter,
                    "-n",
                    "-T", "fields",
                    "-e", "frame.time_relative",
                    "-e", "ip.src",
                    "-e", "ip.dst",
                    "-e", "tcp.len",
                ]);
                c
            }
            PacketBackend::Tcpdump => {
                let mut c = Command::new("tcpdump");
                c.args(["-i", &config.interface, "-q", "-n", "-ttttt", filter]);
                c
            }
        };
        command.stdout(Stdio::piped()).stderr(Stdio::null());

        let mut child = command
            .spawn()
            .map_err(|e| IdError::PacketSource(format!("failed to spawn {:?}: {e}", config.backend)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| IdError::PacketSource("child process has no stdout".into()))?;
        let lines = BufReader::new(stdout).lines();

        info!(backend = ?config.backend, interface = %config.interface, "Packet analyzer up and running");

        Ok(Self { backend: config.backend, child, lines })
    }

    /// Read the next parseable packet line, skipping unparseable ones.
    /// Returns `None` on clean EOF.
    pub async fn next_packet(&mut self) -> Result<Option<PacketLine>> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                Err(e) => return Err(IdError::PacketSource(format!("read error: {e}"))),
            };
            match self.backend {
                PacketBackend::Tshark => {
                    if let Some(pkt) = parse_tshark_line(&line) {
                        return Ok(Some(pkt));
                    }
                }
                PacketBackend::Tcpdump => {
                    if let Some(pkt) = parse_tcpdump_line(&line) {
                        return Ok(Some(pkt));
                    }
                }
            }
            warn!(line = %line, "Unparseable packet line, skipping");
        }
    }

    pub async fn shutdown(mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

fn parse_tshark_line(line: &str) -> Option<PacketLine> {
    let mut fields = line.split('\t');
    let t: f64 = fields.next()?.trim().parse().ok()?;
    let src: IpAddr = fields.next()?.trim().parse().ok()?;
    let dst: IpAddr = fields.next()?.trim().parse().ok()?;
    let size: i64 = fields.next()?.trim().parse().ok()?;
    Some(PacketLine { t, src, dst, size })
}

fn parse_tcpdump_line(line: &str) -> Option<PacketLine> {
    let mut tokens = line.split_whitespace();
    let t = parse_tcpdump_timestamp(tokens.next()?)?;

    let proto = tokens.next()?;
    if proto != "IP" && proto != "IP6" {
        return None;
    }
    let src_tok = tokens.next()?;
    if tokens.next()? != ">" {
        return None;
    }
    let dst_tok = tokens.next()?.trim_end_matches(':');

    let src = parse_ip_and_port(src_tok)?;
    let dst = parse_ip_and_port(dst_tok)?;

    let rest: Vec<&str> = tokens.collect();
    let len_pos = rest.iter().position(|&tok| tok == "length")?;
    let size_tok = rest.get(len_pos + 1)?;
    let size: i64 = size_tok.trim_end_matches(|c: char| !c.is_ascii_digit()).parse().ok()?;

    Some(PacketLine { t, src, dst, size })
}

fn parse_tcpdump_timestamp(tok: &str) -> Option<f64> {
    let mut parts = tok.splitn(3, ':');
    let h: f64 = parts.next()?.parse().ok()?;
    let m: f64 = parts.next()?.parse().ok()?;
    let s: f64 = parts.next()?.parse().ok()?;
    Some(h * 3600.0 + m * 60.0 + s)
}

fn parse_ip_and_port(tok: &str) -> Option<IpAddr> {
    let (ip_part, _port) = tok.rsplit_once('.')?;
    ip_part.parse().ok()
}

/// Resolve the BPF capture filter from the known CDN hostname patterns,
/// widening to the two broader patterns when `full_cdn_search` is set.
/// Uses `tokio::net::lookup_host` rather than a dedicated DNS crate.
pub async fn build_capture_filter(full_cdn_search: bool) -> Result<String> {
    let mut hostnames: Vec<String> = (0..=9).map(|n| format!("ed{n}.cdn.svt.se")).collect();
    if full_cdn_search {
        hostnames.extend((1..=10).map(|n| format!("svt-vod-{n}.secure.footprint.net")));
        hostnames.extend((1..=9).flat_map(|n| {
            (b'a'..=b't').map(move |c| format!("svt-vod-{n}{}.akamaized.net", c as char))
        }));
    }

    let mut ips = std::collections::BTreeSet::new();
    for host in &hostnames {
        match tokio::net::lookup_host((host.as_str(), 443)).await {
            Ok(addrs) => {
                for addr in addrs {
                    ips.insert(addr.ip());
                }
            }
            Err(e) => warn!(host = %host, error = %e, "CDN hostname resolution failed, skipping"),
        }
    }

    if ips.is_empty() {
        return Err(IdError::PacketSource("no CDN IPs resolved for capture filter".into()));
    }

    let clauses: Vec<String> = ips.iter().map(|ip| format!("src {ip}")).collect();
    Ok(format!("{} and greater 0", clauses.join(" or ")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tshark_fields_line() {
        let line = "12.345\t10.0.0.1\t10.0.0.2\t1400";
        let pkt = parse_tshark_line(line).unwrap();
        assert_eq!(pkt.t, 12.345);
        assert_eq!(pkt.size, 1400);
        assert_eq!(pkt.src.to_string(), "10.0.0.1");
        assert_eq!(pkt.dst.to_string(), "10.0.0.2");
    }

    #[test]
    fn skips_tshark_line_with_missing_tcp_len() {
        let line = "12.345\t10.0.0.1\t10.0.0.2\t";
        assert!(parse_tshark_line(line).is_none());
    }

    #[test]
    fn parses_tcpdump_line() {
        let line = "00:00:02.123456 IP 10.0.0.1.443 > 10.0.0.2.54321: Flags [P.], seq 1:1401, ack 1, win 502, length 1400";
        let pkt = parse_tcpdump_line(line).unwrap();
        assert_eq!(pkt.t, 2.123456);
        assert_eq!(pkt.size, 1400);
        assert_eq!(pkt.src.to_string(), "10.0.0.1");
        assert_eq!(pkt.dst.to_string(), "10.0.0.2");
    }

    #[test]
    fn ignores_non_ip_tcpdump_line() {
        let line = "00:00:02.123456 ARP, Request who-has 10.0.0.1 tell 10.0.0.254, length 28";
        assert!(parse_tcpdump_line(line).is_none());
    }

    #[test]
    fn timestamp_conversion_matches_hms() {
        assert_eq!(parse_tcpdump_timestamp("01:02:03.500000").unwrap(), 3723.5);
    }
}
