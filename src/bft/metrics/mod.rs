//! Counters and timers, emitted over datagrams to an external collector
//! (spec.md §1: "metrics emission — a collector receiving counters and
//! timers over datagrams" is an out-of-scope external collaborator; only
//! the emission contract is specified).
//!
//! [`Audit`](crate::bft::audit::Audit) and the failure detector are the
//! two callers that actually emit through this facade today.

use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::Mutex;
use std::time::Duration;

/// A sink for the counters and timers this crate emits.
///
/// Kept as a trait, rather than a concrete client, so tests can swap in
/// a no-op or recording implementation without touching a real socket.
pub trait MetricsSink: Send + Sync {
    /// Increments `name` by one.
    fn counter(&self, name: &str);

    /// Records a single timing sample for `name`.
    fn timing(&self, name: &str, elapsed: Duration);
}

/// Discards every metric. Used when no `monitor address/port` is
/// configured (spec.md §6 "Configuration inputs").
#[derive(Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn counter(&self, _name: &str) {}
    fn timing(&self, _name: &str, _elapsed: Duration) {}
}

/// Emits statsd-shaped lines (`name:value|c` / `name:value|ms`) over a
/// UDP datagram to the configured monitor address, matching the
/// "collector receiving counters and timers over datagrams" contract.
///
/// A send failure (collector down, ENOBUFS, ...) is swallowed: metrics
/// are best-effort and must never perturb protocol progress.
pub struct UdpMetricsSink {
    socket: Mutex<UdpSocket>,
}

impl UdpMetricsSink {
    /// Binds an ephemeral local socket and connects it to `monitor_addr`
    /// (the host:port pair spec.md calls "monitor address/port").
    pub fn connect<A: ToSocketAddrs>(monitor_addr: A) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(monitor_addr)?;
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }

    fn send_line(&self, line: &str) {
        if let Ok(socket) = self.socket.lock() {
            let _ = socket.send(line.as_bytes());
        }
    }
}

impl MetricsSink for UdpMetricsSink {
    fn counter(&self, name: &str) {
        self.send_line(&format!("{}:1|c", name));
    }

    fn timing(&self, name: &str, elapsed: Duration) {
        self.send_line(&format!("{}:{}|ms", name, elapsed.as_millis()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_sink_does_nothing_observable() {
        let sink = NoopMetricsSink;
        sink.counter("pbft_primary_conflict");
        sink.timing("pbft_commit_latency", Duration::from_millis(5));
    }

    #[test]
    fn udp_sink_connects_and_sends_without_panicking() {
        let collector = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = collector.local_addr().unwrap();
        let sink = UdpMetricsSink::connect(addr).unwrap();
        sink.counter("pbft_commit_conflict");
        sink.timing("pbft_round_trip", Duration::from_millis(12));

        let mut buf = [0; 64];
        collector.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let (n, _) = collector.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pbft_commit_conflict:1|c");
    }
}
