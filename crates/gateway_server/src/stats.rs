//! Per-process status counters.

use serde::Serialize;
use std::cell::Cell;
use std::time::{SystemTime, UNIX_EPOCH};

/// Counter kinds reported on SIGUSR1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Accepted connections and received client datagrams.
    TotalRequest,
    /// Frames rejected by a probe (malformed or oversized).
    PacketErr,
    /// Faults raised while handling a complete frame.
    ThrowException,
    /// Readiness reported but nothing to accept or receive.
    ThunderHerd,
    /// Clients that disconnected on their own.
    ClientClose,
    /// Writes that failed or missed their deadline.
    SendFail,
    /// Envelopes addressed to a socket that is no longer live.
    RoutingMiss,
    /// Client frames dropped because no worker link was available.
    RoutingFail,
}

/// Single-threaded counters, owned by one Gateway or BusinessWorker.
#[derive(Debug)]
pub struct Stats {
    start_time: u64,
    total_request: Cell<u64>,
    packet_err: Cell<u64>,
    throw_exception: Cell<u64>,
    thunder_herd: Cell<u64>,
    client_close: Cell<u64>,
    send_fail: Cell<u64>,
    routing_miss: Cell<u64>,
    routing_fail: Cell<u64>,
}

/// Serializable copy of [`Stats`] at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub start_time: u64,
    pub total_request: u64,
    pub packet_err: u64,
    pub throw_exception: u64,
    pub thunder_herd: u64,
    pub client_close: u64,
    pub send_fail: u64,
    pub routing_miss: u64,
    pub routing_fail: u64,
}

impl Stats {
    pub fn new() -> Self {
        let start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            start_time,
            total_request: Cell::new(0),
            packet_err: Cell::new(0),
            throw_exception: Cell::new(0),
            thunder_herd: Cell::new(0),
            client_close: Cell::new(0),
            send_fail: Cell::new(0),
            routing_miss: Cell::new(0),
            routing_fail: Cell::new(0),
        }
    }

    fn cell(&self, counter: Counter) -> &Cell<u64> {
        match counter {
            Counter::TotalRequest => &self.total_request,
            Counter::PacketErr => &self.packet_err,
            Counter::ThrowException => &self.throw_exception,
            Counter::ThunderHerd => &self.thunder_herd,
            Counter::ClientClose => &self.client_close,
            Counter::SendFail => &self.send_fail,
            Counter::RoutingMiss => &self.routing_miss,
            Counter::RoutingFail => &self.routing_fail,
        }
    }

    pub fn incr(&self, counter: Counter) -> u64 {
        let cell = self.cell(counter);
        let value = cell.get().saturating_add(1);
        cell.set(value);
        value
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.cell(counter).get()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            start_time: self.start_time,
            total_request: self.total_request.get(),
            packet_err: self.packet_err.get(),
            throw_exception: self.throw_exception.get(),
            thunder_herd: self.thunder_herd.get(),
            client_close: self.client_close.get(),
            send_fail: self.send_fail.get(),
            routing_miss: self.routing_miss.get(),
            routing_fail: self.routing_fail.get(),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_independent() {
        let stats = Stats::new();
        assert_eq!(stats.incr(Counter::PacketErr), 1);
        assert_eq!(stats.incr(Counter::PacketErr), 2);
        stats.incr(Counter::RoutingMiss);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.packet_err, 2);
        assert_eq!(snapshot.routing_miss, 1);
        assert_eq!(snapshot.total_request, 0);
    }

    #[test]
    fn test_snapshot_serializes_with_counter_names() {
        let stats = Stats::new();
        stats.incr(Counter::SendFail);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["send_fail"], 1);
        assert_eq!(json["thunder_herd"], 0);
    }
}
