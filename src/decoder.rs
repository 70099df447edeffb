//! Online FEC Decoder: block-MDS counting for Strategy B, sparse GF(2) Gaussian
//! elimination for Strategies C and D. See spec.md §4.2.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::model::{Direction, Metadata, SimId};

/// A lost real packet held in the registry until recovered or retransmission-delivered.
/// A cheap-to-clone stand-in for a non-owning handle into the trace.
#[derive(Clone, Copy, Debug)]
pub struct LostEntry {
    pub original_ts: f64,
    pub length: i64,
}

/// Per-direction decoder state: the Strategy B block table, the GF(2) basis, and the
/// lost-packet registry.
pub struct FecDecoder {
    block_size: u64,
    b_counts: HashMap<(usize, u64), u64>,
    basis: [BTreeMap<SimId, BTreeSet<SimId>>; 2],
    lost: [BTreeMap<SimId, LostEntry>; 2],
}

impl FecDecoder {
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size,
            b_counts: HashMap::new(),
            basis: [BTreeMap::new(), BTreeMap::new()],
            lost: [BTreeMap::new(), BTreeMap::new()],
        }
    }

    /// Clears all per-direction state. Called at the start of every `simulate()`.
    pub fn reset(&mut self) {
        self.b_counts.clear();
        self.basis = [BTreeMap::new(), BTreeMap::new()];
        self.lost = [BTreeMap::new(), BTreeMap::new()];
    }

    pub fn is_lost(&self, direction: Direction, sim_id: SimId) -> bool {
        self.lost[direction.idx()].contains_key(&sim_id)
    }

    pub fn mark_lost(&mut self, direction: Direction, sim_id: SimId, entry: LostEntry) {
        self.lost[direction.idx()].insert(sim_id, entry);
    }

    /// A retransmission of `sim_id` was delivered directly. Removes it from the
    /// registry and purges it from every GF(2) equation, re-running the singleton
    /// cascade since purging an unknown can make others solvable. Returns the
    /// entry for `sim_id` (if it really was outstanding) plus any cascade recoveries.
    pub fn remove_lost(
        &mut self,
        direction: Direction,
        sim_id: SimId,
    ) -> Option<(LostEntry, Vec<(SimId, LostEntry)>)> {
        let entry = self.lost[direction.idx()].remove(&sim_id)?;

        let idx = direction.idx();
        let affected: Vec<SimId> = self.basis[idx]
            .iter()
            .filter(|(_, eq)| eq.contains(&sim_id))
            .map(|(&pivot, _)| pivot)
            .collect();
        for pivot in affected {
            let mut eq = self.basis[idx].remove(&pivot).expect("key came from this basis");
            eq.remove(&sim_id);
            if !eq.is_empty() {
                insert_equation(&mut self.basis[idx], eq);
            }
        }

        let solved = drain_singletons(&mut self.basis[idx]);
        let cascade = self.collect_recovered(direction, solved);

        Some((entry, cascade))
    }

    /// A repair symbol arrived on `direction`. Returns every real packet recovered
    /// as a result (possibly more than one, possibly none).
    pub fn recv_repair(&mut self, direction: Direction, metadata: &Metadata) -> Vec<(SimId, LostEntry)> {
        let solved = match metadata {
            Metadata::Dummy { .. } => Vec::new(),
            Metadata::RepairB {
                block_id,
                protected_count,
            } => self.recv_repair_b(direction, *block_id, *protected_count),
            Metadata::RepairC { covered_ids } => {
                let row: BTreeSet<SimId> = covered_ids
                    .iter()
                    .copied()
                    .filter(|id| self.is_lost(direction, *id))
                    .collect();
                self.recv_gf2_row(direction, row)
            }
            Metadata::RepairD { start_id, end_id } => {
                let row: BTreeSet<SimId> = (*start_id..=*end_id)
                    .filter(|id| self.is_lost(direction, *id))
                    .collect();
                self.recv_gf2_row(direction, row)
            }
        };
        self.collect_recovered(direction, solved)
    }

    fn recv_repair_b(&mut self, direction: Direction, block_id: u64, protected_count: u64) -> Vec<SimId> {
        let counter = self.b_counts.entry((direction.idx(), block_id)).or_insert(0);
        *counter += 1;
        let fec_count = *counter;

        let start = block_id * self.block_size + 1;
        let end = start + protected_count - 1;

        let lost_in_block: Vec<SimId> = self.lost[direction.idx()]
            .range(start..=end)
            .map(|(id, _)| *id)
            .collect();

        if fec_count >= lost_in_block.len() as u64 {
            lost_in_block
        } else {
            Vec::new()
        }
    }

    fn recv_gf2_row(&mut self, direction: Direction, row: BTreeSet<SimId>) -> Vec<SimId> {
        if row.is_empty() {
            // All covered identifiers already delivered or recovered: redundant.
            return Vec::new();
        }
        let basis = &mut self.basis[direction.idx()];
        insert_equation(basis, row);
        drain_singletons(basis)
    }

    fn collect_recovered(&mut self, direction: Direction, ids: Vec<SimId>) -> Vec<(SimId, LostEntry)> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.lost[direction.idx()].remove(&id) {
                out.push((id, entry));
            }
        }
        out
    }
}

/// Integrates `row` into `basis` via pivot-by-minimum-element reduction over GF(2)
/// (symmetric difference is XOR since coefficients are implicitly 1). Discards the
/// row silently if it reduces to empty (fully redundant).
fn insert_equation(basis: &mut BTreeMap<SimId, BTreeSet<SimId>>, mut row: BTreeSet<SimId>) {
    loop {
        let pivot = match row.iter().next().copied() {
            Some(p) => p,
            None => return,
        };
        match basis.get(&pivot) {
            Some(existing) => {
                row = row.symmetric_difference(existing).copied().collect();
            }
            None => {
                basis.insert(pivot, row.clone());
                back_substitute(basis, pivot, &row);
                return;
            }
        }
    }
}

/// XORs the newly-inserted `row` (keyed at `pivot`) out of every other equation that
/// still mentions `pivot`, keeping the basis in reduced row-echelon form.
fn back_substitute(basis: &mut BTreeMap<SimId, BTreeSet<SimId>>, pivot: SimId, row: &BTreeSet<SimId>) {
    let affected: Vec<SimId> = basis
        .iter()
        .filter(|&(&key, eq)| key != pivot && eq.contains(&pivot))
        .map(|(&key, _)| key)
        .collect();
    for key in affected {
        let eq = basis.get(&key).expect("key came from this basis");
        let reduced: BTreeSet<SimId> = eq.symmetric_difference(row).copied().collect();
        basis.insert(key, reduced);
    }
}

/// Repeatedly removes singleton equations `{x}`, recording `x` as recovered and
/// removing it from every remaining equation, until no singletons remain.
fn drain_singletons(basis: &mut BTreeMap<SimId, BTreeSet<SimId>>) -> Vec<SimId> {
    let mut recovered = Vec::new();
    loop {
        let solved: Vec<SimId> = basis
            .values()
            .filter(|eq| eq.len() == 1)
            .map(|eq| *eq.iter().next().expect("len == 1"))
            .collect();
        if solved.is_empty() {
            break;
        }
        for eq in basis.values_mut() {
            for id in &solved {
                eq.remove(id);
            }
        }
        basis.retain(|_, eq| !eq.is_empty());
        recovered.extend(solved);
    }
    recovered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ts: f64) -> LostEntry {
        LostEntry {
            original_ts: ts,
            length: 100,
        }
    }

    #[test]
    fn strategy_b_exact_mds() {
        let mut dec = FecDecoder::new(4);
        dec.mark_lost(Direction::Outbound, 2, entry(0.02));

        let recovered = dec.recv_repair(
            Direction::Outbound,
            &Metadata::RepairB {
                block_id: 0,
                protected_count: 4,
            },
        );
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].0, 2);
    }

    #[test]
    fn strategy_b_insufficient_credit_withholds() {
        let mut dec = FecDecoder::new(4);
        dec.mark_lost(Direction::Outbound, 2, entry(0.02));
        dec.mark_lost(Direction::Outbound, 3, entry(0.03));

        let recovered = dec.recv_repair(
            Direction::Outbound,
            &Metadata::RepairB {
                block_id: 0,
                protected_count: 4,
            },
        );
        assert!(recovered.is_empty());

        let recovered = dec.recv_repair(
            Direction::Outbound,
            &Metadata::RepairB {
                block_id: 0,
                protected_count: 4,
            },
        );
        let mut ids: Vec<SimId> = recovered.iter().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn two_independent_d_repairs_recover_via_reduction() {
        let mut dec = FecDecoder::new(10);
        dec.mark_lost(Direction::Outbound, 2, entry(0.02));
        dec.mark_lost(Direction::Outbound, 5, entry(0.05));

        // Repair covering [1..3] with only 2 unknown -> equation {2}.
        let recovered = dec.recv_repair(
            Direction::Outbound,
            &Metadata::RepairD {
                start_id: 1,
                end_id: 3,
            },
        );
        assert_eq!(recovered.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![2]);

        // Repair covering [2..6]; 2 already known, only 5 left -> recovers 5.
        let recovered = dec.recv_repair(
            Direction::Outbound,
            &Metadata::RepairD {
                start_id: 2,
                end_id: 6,
            },
        );
        assert_eq!(recovered.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![5]);
    }

    #[test]
    fn redundant_c_repair_is_discarded_silently() {
        let mut dec = FecDecoder::new(10);
        dec.mark_lost(Direction::Outbound, 1, entry(0.01));

        let recovered = dec.recv_repair(
            Direction::Outbound,
            &Metadata::RepairC {
                covered_ids: vec![1, 2],
            },
        );
        assert_eq!(recovered.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![1]);

        // 1 is already recovered, 2 was never lost: coverage intersection is empty.
        let recovered = dec.recv_repair(
            Direction::Outbound,
            &Metadata::RepairC {
                covered_ids: vec![1],
            },
        );
        assert!(recovered.is_empty());
    }

    #[test]
    fn retransmission_purge_triggers_cascade() {
        let mut dec = FecDecoder::new(10);
        dec.mark_lost(Direction::Outbound, 2, entry(0.02));
        dec.mark_lost(Direction::Outbound, 5, entry(0.05));

        // Build equation {2, 5} without enough info to solve either alone.
        let recovered = dec.recv_repair(
            Direction::Outbound,
            &Metadata::RepairD {
                start_id: 2,
                end_id: 5,
            },
        );
        assert!(recovered.is_empty());

        // 2 arrives via its own retransmission: purge leaves {5} as a singleton.
        let (direct, cascade) = dec.remove_lost(Direction::Outbound, 2).unwrap();
        assert_eq!(direct.original_ts, 0.02);
        assert_eq!(cascade.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![5]);
    }

    /// Regression: removing a `sim_id` that is a basis equation's *pivot* (map key),
    /// not just a member, must re-key the residual equation rather than leave it
    /// mutated in place under its old, now-wrong key.
    #[test]
    fn remove_lost_rekeys_equation_when_sim_id_was_the_pivot() {
        let mut dec = FecDecoder::new(10);
        dec.mark_lost(Direction::Outbound, 2, entry(0.02));
        dec.mark_lost(Direction::Outbound, 5, entry(0.05));
        dec.mark_lost(Direction::Outbound, 8, entry(0.08));

        // Equation {2, 5, 8} keyed at pivot 2 (its minimum element).
        let recovered = dec.recv_repair(
            Direction::Outbound,
            &Metadata::RepairD {
                start_id: 2,
                end_id: 8,
            },
        );
        assert!(recovered.is_empty());

        // 2 (the pivot) arrives via its own retransmission: the residual {5, 8}
        // must be re-keyed at its own new minimum, 5.
        let (direct, cascade) = dec.remove_lost(Direction::Outbound, 2).unwrap();
        assert_eq!(direct.original_ts, 0.02);
        assert!(cascade.is_empty(), "{{5, 8}} is not yet a singleton");

        let basis = &dec.basis[Direction::Outbound.idx()];
        assert_eq!(basis.len(), 1, "exactly one equation should remain");
        assert_eq!(basis.get(&5), Some(&BTreeSet::from([5, 8])));

        // A second, fully redundant repair over {5, 8} must reduce to empty against
        // the correctly-rekeyed equation and be discarded, not inserted as a spurious
        // duplicate equation (which is what a stale pivot key would cause).
        let recovered = dec.recv_repair(
            Direction::Outbound,
            &Metadata::RepairD {
                start_id: 5,
                end_id: 8,
            },
        );
        assert!(recovered.is_empty());
        let basis = &dec.basis[Direction::Outbound.idx()];
        assert_eq!(basis.len(), 1, "redundant repair must not create a duplicate equation");
        assert_eq!(basis.get(&5), Some(&BTreeSet::from([5, 8])));
    }

    #[test]
    fn basis_invariant_unique_pivot_per_equation() {
        let mut dec = FecDecoder::new(10);
        for id in [2u64, 4, 6, 8] {
            dec.mark_lost(Direction::Outbound, id, entry(id as f64 / 100.0));
        }
        dec.recv_repair(
            Direction::Outbound,
            &Metadata::RepairD {
                start_id: 1,
                end_id: 8,
            },
        );
        dec.recv_repair(
            Direction::Outbound,
            &Metadata::RepairC {
                covered_ids: vec![2, 4],
            },
        );

        let basis = &dec.basis[Direction::Outbound.idx()];
        let mut seen_pivots = std::collections::HashSet::new();
        for (&pivot, eq) in basis.iter() {
            assert!(eq.contains(&pivot));
            assert!(seen_pivots.insert(pivot));
            for (&other_pivot, other_eq) in basis.iter() {
                if other_pivot != pivot {
                    assert!(!other_eq.contains(&pivot));
                }
            }
        }
    }
}
