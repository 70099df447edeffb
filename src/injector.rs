//! FEC Injector: a per-direction state machine that attaches repair descriptors to
//! dummy slots in a scheduled trace. See spec.md §4.1.

use std::collections::VecDeque;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::model::{Direction, Metadata, ScheduledPacket, SimId, Strategy};
use crate::Packet;

/// Constructor parameters for [`FecInjector`]. Mirrors the "Injector options" surface
/// in spec.md §6.
#[derive(Clone, Debug)]
pub struct InjectorConfig {
    pub strategy: Strategy,
    pub window_size: u64,
    pub block_size: u64,
    pub seed: u64,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::A,
            window_size: 32,
            block_size: 10,
            seed: 0,
        }
    }
}

enum StrategyState {
    None,
    FixedBucket {
        current_block_id: u64,
        packets_in_current_block: u64,
    },
    SparseRandom {
        history: VecDeque<SimId>,
    },
    SlidingWindow {
        head_id: Option<SimId>,
    },
}

impl StrategyState {
    fn new(strategy: Strategy) -> Self {
        match strategy {
            Strategy::A => StrategyState::None,
            Strategy::B => StrategyState::FixedBucket {
                current_block_id: 0,
                packets_in_current_block: 0,
            },
            Strategy::C => StrategyState::SparseRandom {
                history: VecDeque::new(),
            },
            Strategy::D => StrategyState::SlidingWindow { head_id: None },
        }
    }
}

/// Per-direction encoding state for one of the four FEC strategies.
pub struct FecInjector {
    strategy: Strategy,
    window_size: u64,
    block_size: u64,
    state: [StrategyState; 2],
    rng: SmallRng,
}

impl FecInjector {
    pub fn new(config: InjectorConfig) -> Self {
        Self {
            strategy: config.strategy,
            window_size: config.window_size,
            block_size: config.block_size,
            state: [
                StrategyState::new(config.strategy),
                StrategyState::new(config.strategy),
            ],
            rng: SmallRng::seed_from_u64(config.seed),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Update encoding-side state for a real packet just sent on `direction`.
    pub fn process_real(&mut self, direction: Direction, sim_id: SimId) {
        match &mut self.state[direction.idx()] {
            StrategyState::None => {}
            StrategyState::FixedBucket {
                current_block_id,
                packets_in_current_block,
            } => {
                *packets_in_current_block += 1;
                if *packets_in_current_block >= self.block_size {
                    *current_block_id += 1;
                    *packets_in_current_block = 0;
                }
            }
            StrategyState::SparseRandom { history } => {
                history.push_back(sim_id);
                if history.len() as u64 > self.window_size {
                    history.pop_front();
                }
            }
            StrategyState::SlidingWindow { head_id } => {
                *head_id = Some(sim_id);
            }
        }
    }

    /// Produce a repair descriptor for the next dummy slot on `direction`.
    pub fn generate_repair(&mut self, direction: Direction) -> Metadata {
        match &mut self.state[direction.idx()] {
            StrategyState::None => Metadata::dummy(Strategy::A, None),
            StrategyState::FixedBucket {
                current_block_id,
                packets_in_current_block,
            } => {
                if *packets_in_current_block > 0 {
                    Metadata::RepairB {
                        block_id: *current_block_id,
                        protected_count: *packets_in_current_block,
                    }
                } else if *current_block_id > 0 {
                    Metadata::RepairB {
                        block_id: *current_block_id - 1,
                        protected_count: self.block_size,
                    }
                } else {
                    Metadata::dummy(Strategy::B, Some("empty block".to_string()))
                }
            }
            StrategyState::SparseRandom { history } => {
                if history.is_empty() {
                    Metadata::dummy(Strategy::C, Some("empty buffer".to_string()))
                } else {
                    let pool: Vec<SimId> = history.iter().copied().collect();
                    let degree = self.rng.gen_range(1..=pool.len());
                    let mut covered: Vec<SimId> =
                        pool.choose_multiple(&mut self.rng, degree).copied().collect();
                    covered.sort_unstable();
                    Metadata::RepairC { covered_ids: covered }
                }
            }
            StrategyState::SlidingWindow { head_id } => match head_id {
                None => Metadata::dummy(Strategy::D, Some("no data yet".to_string())),
                Some(head) => {
                    let start = head
                        .saturating_sub(self.window_size.saturating_sub(1))
                        .max(1);
                    Metadata::RepairD {
                        start_id: start,
                        end_id: *head,
                    }
                }
            },
        }
    }
}

/// Runs the injector offline over a scheduled trace, producing the annotated trace
/// the transport simulator replays. Owns the per-direction dense `sim_id` counters;
/// these reconstruct the same sequence the simulator assigns on first send, since
/// loss never reorders first sends.
pub fn annotate(trace: Vec<ScheduledPacket>, injector: &mut FecInjector) -> Vec<Packet> {
    let mut counters = [0u64; 2];
    trace
        .into_iter()
        .map(|p| {
            let direction = p.direction();
            if p.real {
                counters[direction.idx()] += 1;
                let sim_id = counters[direction.idx()];
                injector.process_real(direction, sim_id);
                Packet {
                    timestamp: p.timestamp,
                    length: p.length,
                    metadata: None,
                }
            } else {
                let metadata = injector.generate_repair(direction);
                Packet {
                    timestamp: p.timestamp,
                    length: p.length,
                    metadata: Some(metadata),
                }
            }
        })
        .collect()
}

/// Relabels a `rate` fraction of real packets as generic dummy slots before
/// injection — the input-side half of `external_fec_rate` (spec.md §4.1, §6).
/// Applying this is the driver's job, not the injector's.
pub fn relabel_as_dummy(trace: &mut [ScheduledPacket], rate: f64, rng: &mut SmallRng) {
    if rate <= 0.0 {
        return;
    }
    for pkt in trace.iter_mut() {
        if pkt.real && rng.gen_bool(rate.min(1.0)) {
            pkt.real = false;
        }
    }
}
