//! Transport Simulator: a discrete-event link simulator coupling bounded in-flight
//! admission, Bernoulli loss, RTO-driven retransmission, and the embedded online FEC
//! decoder. See spec.md §4.3.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::decoder::{FecDecoder, LostEntry};
use crate::drop::BernoulliLoss;
use crate::model::{Direction, OutputPacket, Packet, SimId};
use crate::stats::Stats;
use crate::{Error, Result};

/// Constructor parameters, mirroring the "Configuration surface" in spec.md §6.
#[derive(Clone, Debug)]
pub struct SimulatorConfig {
    pub loss_rate: f64,
    pub rtt: f64,
    pub max_inflight: u64,
    pub seed: u64,
    pub external_fec_rate: f64,
    pub block_size: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            rtt: 0.1,
            max_inflight: 20,
            seed: 0,
            external_fec_rate: 0.0,
            block_size: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct PacketRuntime {
    sim_id: Option<SimId>,
    retrans_count: u32,
    delivered: bool,
    acked: bool,
}

#[derive(Clone, Copy, Debug)]
enum EventKind {
    Arrival,
    Timeout,
    Ack,
    AckClear,
}

#[derive(Clone, Copy, Debug)]
struct Event {
    time: f64,
    seq: u64,
    kind: EventKind,
    trace_idx: usize,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Reversed so a max-heap `BinaryHeap` pops the earliest time (ties broken by
/// insertion order), grounded on the other_examples tcp-lab simulator's `Event` idiom.
impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .partial_cmp(&self.time)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Drives one discrete-event run over an already-annotated trace.
pub struct Simulator {
    trace: Vec<Packet>,
    runtime: Vec<PacketRuntime>,
    rtt: f64,
    max_inflight: u64,
    loss: BernoulliLoss,
    decoder: FecDecoder,
    events: BinaryHeap<Event>,
}

impl Simulator {
    pub fn new(trace: Vec<Packet>, config: SimulatorConfig) -> Result<Self> {
        if !(0.0..1.0).contains(&config.loss_rate) {
            return Err(Error::InvalidParameter(format!(
                "loss_rate must be in [0, 1), got {}",
                config.loss_rate
            )));
        }
        if config.rtt <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "rtt must be positive, got {}",
                config.rtt
            )));
        }
        if config.max_inflight == 0 {
            return Err(Error::InvalidParameter(
                "max_inflight must be positive".to_string(),
            ));
        }

        let runtime = vec![PacketRuntime::default(); trace.len()];
        Ok(Self {
            trace,
            runtime,
            rtt: config.rtt,
            max_inflight: config.max_inflight,
            loss: BernoulliLoss::new(config.loss_rate, config.seed),
            decoder: FecDecoder::new(config.block_size),
            events: BinaryHeap::new(),
        })
    }

    /// Runs the event loop to completion, returning the received trace (sorted by
    /// arrival timestamp, stable) and the run's aggregate statistics.
    pub fn simulate(&mut self) -> (Vec<OutputPacket>, Stats) {
        self.decoder.reset();
        self.events.clear();
        for r in &mut self.runtime {
            *r = PacketRuntime::default();
        }

        let mut stats = Stats::new();
        for pkt in &self.trace {
            if pkt.is_real() {
                stats.total_real += 1;
            } else if pkt.metadata.as_ref().map(|m| m.is_repair()).unwrap_or(false) {
                stats.total_fec += 1;
            } else {
                stats.total_dummy += 1;
            }
        }

        let mut out: Vec<OutputPacket> = Vec::new();
        let mut sim_id_index: [HashMap<SimId, usize>; 2] = [HashMap::new(), HashMap::new()];
        let mut sim_id_counters = [0u64; 2];
        let mut inflight = [0u64; 2];
        let mut seq = 0u64;
        let mut current_time = 0.0f64;
        let mut trace_idx = 0usize;

        loop {
            let send_ready = trace_idx < self.trace.len() && {
                let pkt = &self.trace[trace_idx];
                let idx = pkt.direction().idx();
                inflight[idx] < self.max_inflight
                    && match self.events.peek() {
                        None => true,
                        Some(ev) => current_time.max(pkt.timestamp) <= ev.time,
                    }
            };

            if send_ready {
                current_time = current_time.max(self.trace[trace_idx].timestamp);
                self.send(
                    trace_idx,
                    current_time,
                    &mut sim_id_counters,
                    &mut sim_id_index,
                    &mut inflight,
                    &mut seq,
                    &mut stats,
                );
                trace_idx += 1;
                continue;
            }

            let event = match self.events.pop() {
                Some(ev) => ev,
                None => break,
            };
            current_time = event.time;

            match event.kind {
                EventKind::Arrival => self.on_arrival(
                    event.trace_idx,
                    current_time,
                    &sim_id_index,
                    &mut seq,
                    &mut out,
                    &mut stats,
                ),
                EventKind::Timeout => {
                    self.on_timeout(event.trace_idx, current_time, &mut seq, &mut stats)
                }
                EventKind::Ack | EventKind::AckClear => {
                    self.on_release(event.trace_idx, &mut inflight)
                }
            }
        }

        out.sort_by(|a, b| a.timestamp.partial_cmp(&b.timestamp).unwrap_or(Ordering::Equal));

        stats.fct = out
            .iter()
            .rev()
            .find(|p| p.is_real())
            .map(|p| p.timestamp)
            .unwrap_or(0.0);

        (out, stats)
    }

    #[allow(clippy::too_many_arguments)]
    fn send(
        &mut self,
        idx: usize,
        current_time: f64,
        sim_id_counters: &mut [u64; 2],
        sim_id_index: &mut [HashMap<SimId, usize>; 2],
        inflight: &mut [u64; 2],
        seq: &mut u64,
        stats: &mut Stats,
    ) {
        let direction = self.trace[idx].direction();
        let d = direction.idx();

        if self.trace[idx].is_real() && self.runtime[idx].sim_id.is_none() {
            sim_id_counters[d] += 1;
            let sim_id = sim_id_counters[d];
            self.runtime[idx].sim_id = Some(sim_id);
            sim_id_index[d].insert(sim_id, idx);
        }

        inflight[d] += 1;

        if self.loss.should_drop() {
            if self.trace[idx].is_real() {
                let sim_id = self.runtime[idx].sim_id.expect("assigned above");
                if self.runtime[idx].retrans_count == 0 {
                    stats.lost_real += 1;
                }
                self.decoder.mark_lost(
                    direction,
                    sim_id,
                    LostEntry {
                        original_ts: self.trace[idx].timestamp,
                        length: self.trace[idx].length,
                    },
                );
                self.push_event(current_time + 1.5 * self.rtt, EventKind::Timeout, idx, seq);
            } else {
                self.push_event(current_time + self.rtt, EventKind::AckClear, idx, seq);
            }
        } else {
            self.push_event(current_time + self.rtt / 2.0, EventKind::Arrival, idx, seq);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_arrival(
        &mut self,
        idx: usize,
        t: f64,
        sim_id_index: &[HashMap<SimId, usize>; 2],
        seq: &mut u64,
        out: &mut Vec<OutputPacket>,
        stats: &mut Stats,
    ) {
        let pkt = self.trace[idx].clone();
        let direction = pkt.direction();

        if pkt.is_real() {
            let sim_id = self.runtime[idx].sim_id.expect("real packet always assigned");
            if self.decoder.is_lost(direction, sim_id) {
                let (_, cascade) = self
                    .decoder
                    .remove_lost(direction, sim_id)
                    .expect("is_lost just confirmed presence");
                if !self.runtime[idx].delivered {
                    self.runtime[idx].delivered = true;
                    out.push(OutputPacket {
                        timestamp: t,
                        length: pkt.length,
                        metadata: pkt.metadata.clone(),
                    });
                    stats.record_latency(t - pkt.timestamp);
                }
                self.emit_recovered(direction, t, cascade, sim_id_index, out, stats);
            } else if !self.runtime[idx].delivered {
                self.runtime[idx].delivered = true;
                out.push(OutputPacket {
                    timestamp: t,
                    length: pkt.length,
                    metadata: pkt.metadata.clone(),
                });
                stats.record_latency(t - pkt.timestamp);
            }
            self.push_event(t + self.rtt / 2.0, EventKind::Ack, idx, seq);
        } else {
            out.push(OutputPacket {
                timestamp: t,
                length: pkt.length,
                metadata: pkt.metadata.clone(),
            });
            if let Some(meta) = &pkt.metadata {
                if meta.is_repair() {
                    let recovered = self.decoder.recv_repair(direction, meta);
                    self.emit_recovered(direction, t, recovered, sim_id_index, out, stats);
                }
            }
            self.push_event(t + self.rtt / 2.0, EventKind::AckClear, idx, seq);
        }
    }

    fn emit_recovered(
        &mut self,
        direction: Direction,
        t: f64,
        recovered: Vec<(SimId, LostEntry)>,
        sim_id_index: &[HashMap<SimId, usize>; 2],
        out: &mut Vec<OutputPacket>,
        stats: &mut Stats,
    ) {
        for (sim_id, entry) in recovered {
            let Some(&rec_idx) = sim_id_index[direction.idx()].get(&sim_id) else {
                continue;
            };
            if self.runtime[rec_idx].delivered {
                continue;
            }
            self.runtime[rec_idx].delivered = true;
            out.push(OutputPacket {
                timestamp: t,
                length: entry.length,
                metadata: None,
            });
            stats.recovered_real += 1;
            stats.record_latency(t - entry.original_ts);
        }
    }

    fn on_timeout(&mut self, idx: usize, current_time: f64, seq: &mut u64, stats: &mut Stats) {
        if self.runtime[idx].delivered {
            return;
        }
        self.runtime[idx].retrans_count += 1;
        stats.retransmitted_real += 1;

        if self.loss.should_drop() {
            self.push_event(current_time + 1.5 * self.rtt, EventKind::Timeout, idx, seq);
        } else {
            self.push_event(current_time + self.rtt / 2.0, EventKind::Arrival, idx, seq);
        }
    }

    fn on_release(&mut self, idx: usize, inflight: &mut [u64; 2]) {
        if self.runtime[idx].acked {
            return;
        }
        self.runtime[idx].acked = true;
        let d = self.trace[idx].direction().idx();
        inflight[d] = inflight[d].saturating_sub(1);
    }

    fn push_event(&mut self, time: f64, kind: EventKind, trace_idx: usize, seq: &mut u64) {
        self.events.push(Event {
            time,
            seq: *seq,
            kind,
            trace_idx,
        });
        *seq += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Metadata;

    fn real(ts: f64, length: i64) -> Packet {
        Packet {
            timestamp: ts,
            length,
            metadata: None,
        }
    }

    fn dummy(ts: f64, length: i64) -> Packet {
        Packet {
            timestamp: ts,
            length,
            metadata: Some(Metadata::dummy(crate::model::Strategy::A, None)),
        }
    }

    #[test]
    fn no_loss_passthrough() {
        let trace: Vec<Packet> = (0..10).map(|i| real(i as f64 / 100.0, 100)).collect();
        let mut sim = Simulator::new(
            trace,
            SimulatorConfig {
                loss_rate: 0.0,
                rtt: 1.0,
                ..Default::default()
            },
        )
        .unwrap();
        let (out, stats) = sim.simulate();
        assert_eq!(stats.lost_real, 0);
        assert_eq!(stats.recovered_real, 0);
        assert_eq!(stats.retransmitted_real, 0);
        assert_eq!(out.len(), 10);
        assert!((stats.fct - 0.59).abs() < 1e-9);
    }

    #[test]
    fn rejects_loss_rate_at_or_above_one() {
        let trace = vec![real(0.0, 100)];
        let err = Simulator::new(
            trace,
            SimulatorConfig {
                loss_rate: 1.0,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn rejects_non_positive_rtt() {
        let trace = vec![real(0.0, 100)];
        let err = Simulator::new(
            trace,
            SimulatorConfig {
                rtt: 0.0,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    /// Regression: a real packet FEC-recovered while its own lagging retransmission
    /// is still in flight must not be delivered a second time when that
    /// retransmission's ARRIVAL event finally fires.
    #[test]
    fn fec_recovered_packet_not_duplicated_by_late_retransmission_arrival() {
        let trace = vec![
            real(0.0, 100),
            Packet {
                timestamp: 0.5,
                length: 100,
                metadata: Some(Metadata::RepairD {
                    start_id: 1,
                    end_id: 1,
                }),
            },
        ];
        let mut sim = Simulator::new(
            trace,
            SimulatorConfig {
                rtt: 1.0,
                ..Default::default()
            },
        )
        .unwrap();

        // sim_id 1 (the real packet at idx 0) was sent, then declared lost.
        sim.runtime[0].sim_id = Some(1);
        sim.decoder.mark_lost(
            Direction::Outbound,
            1,
            LostEntry {
                original_ts: 0.0,
                length: 100,
            },
        );

        let mut sim_id_index: [HashMap<SimId, usize>; 2] = [HashMap::new(), HashMap::new()];
        sim_id_index[Direction::Outbound.idx()].insert(1, 0);

        let mut out = Vec::new();
        let mut stats = Stats::new();
        let mut seq = 0u64;

        // The repair (idx 1) arrives first and FEC-recovers sim_id 1.
        sim.on_arrival(1, 0.5, &sim_id_index, &mut seq, &mut out, &mut stats);
        assert_eq!(out.iter().filter(|p| p.is_real()).count(), 1);
        assert_eq!(stats.recovered_real, 1);

        // The packet's own straggling retransmission then arrives too.
        sim.on_arrival(0, 0.6, &sim_id_index, &mut seq, &mut out, &mut stats);

        let real_count = out.iter().filter(|p| p.is_real()).count();
        assert_eq!(
            real_count, 1,
            "a FEC-recovered packet must not be re-delivered by its own late retransmission"
        );
    }

    #[test]
    fn strategy_a_never_recovers_even_with_loss() {
        let mut trace = Vec::new();
        for i in 0..5u64 {
            trace.push(real(i as f64 * 0.01, 100));
            trace.push(dummy(i as f64 * 0.01 + 0.005, 100));
        }
        let mut sim = Simulator::new(
            trace,
            SimulatorConfig {
                loss_rate: 0.3,
                rtt: 1.0,
                seed: 7,
                ..Default::default()
            },
        )
        .unwrap();
        let (_, stats) = sim.simulate();
        assert_eq!(stats.recovered_real, 0);
    }
}
