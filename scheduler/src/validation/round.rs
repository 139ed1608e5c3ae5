//! Round state, validator pairing and block comparison.

use crate::error::{Result, SchedulerError};
use common::{NodeId, same_content};
use serde::Serialize;
use std::collections::BTreeMap;

/// One validation round. Installed whole at round start and never mutated.
#[derive(Clone, Debug, Serialize)]
pub struct RoundState {
    pub round_id: String,
    pub seed: u64,
    pub started_at: u64,
    /// Validator -> nodes it receives streams from
    pub pairing: BTreeMap<NodeId, Vec<NodeId>>,
}

impl RoundState {
    pub fn validator_of(&self, node_id: &str) -> Option<&NodeId> {
        self.pairing
            .iter()
            .find(|(_, nodes)| nodes.iter().any(|n| n == node_id))
            .map(|(validator, _)| validator)
    }

    pub fn node_count(&self) -> usize {
        self.pairing.values().map(Vec::len).sum()
    }
}

/// Deal `validatable` round-robin over `validators`. A node is never paired
/// with itself; a node only a single self-validator could take is left out.
pub fn pair_nodes(validators: &[NodeId], validatable: &[NodeId]) -> BTreeMap<NodeId, Vec<NodeId>> {
    let mut pairing: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    if validators.is_empty() {
        return pairing;
    }
    let mut cursor = 0;
    for node in validatable {
        for attempt in 0..validators.len() {
            let validator = &validators[(cursor + attempt) % validators.len()];
            if validator != node {
                pairing.entry(validator.clone()).or_default().push(node.clone());
                cursor += attempt + 1;
                break;
            }
        }
    }
    pairing
}

/// Compare reported CIDs against the referee's derivation, in order. The
/// first mismatch is an integrity violation. `expected` must cover every
/// reported block.
pub fn compare_blocks(reported: &[String], expected: &[String]) -> Result<()> {
    for (index, cid) in reported.iter().enumerate() {
        let Some(want) = expected.get(index) else {
            return Err(SchedulerError::IntegrityViolation {
                index,
                reported: cid.clone(),
                expected: String::new(),
            });
        };
        if !same_content(cid, want) {
            return Err(SchedulerError::IntegrityViolation {
                index,
                reported: cid.clone(),
                expected: want.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::cid_of_block;

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn cids(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| cid_of_block(format!("block {i}").as_bytes()).unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_pairing_is_balanced_and_skips_self() {
        let validators = ids(&["c_1", "c_2"]);
        let nodes = ids(&["c_1", "c_2", "e_1", "e_2", "e_3", "e_4"]);
        let pairing = pair_nodes(&validators, &nodes);

        assert_eq!(pairing.values().map(Vec::len).sum::<usize>(), 6);
        for (validator, paired) in &pairing {
            assert!(!paired.contains(validator));
            assert_eq!(paired.len(), 3);
        }
    }

    #[test]
    fn test_single_validator_drops_itself() {
        let pairing = pair_nodes(&ids(&["c_1"]), &ids(&["c_1", "e_1"]));
        assert_eq!(pairing.get("c_1").unwrap(), &ids(&["e_1"]));
        assert!(pair_nodes(&[], &ids(&["e_1"])).is_empty());
    }

    #[test]
    fn test_validator_lookup() {
        let round = RoundState {
            round_id: "r".into(),
            seed: 1,
            started_at: 0,
            pairing: pair_nodes(&ids(&["c_1"]), &ids(&["e_1", "e_2"])),
        };
        assert_eq!(round.validator_of("e_2").map(String::as_str), Some("c_1"));
        assert!(round.validator_of("e_9").is_none());
        assert_eq!(round.node_count(), 2);
    }

    #[test]
    fn test_third_block_mismatch_fails_whole_report() {
        let expected = cids(5);
        let mut reported = expected.clone();
        reported[2] = cid_of_block(b"forged").unwrap().to_string();

        match compare_blocks(&reported, &expected) {
            Err(SchedulerError::IntegrityViolation { index, .. }) => assert_eq!(index, 2),
            other => panic!("expected IntegrityViolation, got {other:?}"),
        }
        assert!(compare_blocks(&expected, &expected).is_ok());
    }
}
