//! Property-based tests for router components
//!
//! These tests use proptest to verify properties that should hold for all inputs

use crate::router::{
    Diagnostic, EventEntry, Payload, RouterConfig, RouterSettings, Sequencer, WaitStrategy,
    WaitStrategyKind,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;

/// Property tests for the claim/consume arithmetic
mod sequencer_properties {
    use super::*;

    #[derive(Debug, Clone)]
    enum Op {
        Claim,
        Consume(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Claim), (1u8..8).prop_map(Op::Consume)]
    }

    proptest! {
        #[test]
        fn claims_never_overrun_the_consumer(
            size_power in 0u32..5,
            ops in prop::collection::vec(op(), 1..200),
        ) {
            let size = 1usize << size_power;
            let sequencer = Sequencer::new(size, Arc::new(WaitStrategy::default())).unwrap();
            let mut claimed = -1i64;
            let mut consumed = -1i64;

            for op in ops {
                match op {
                    Op::Claim => match sequencer.try_claim_next().unwrap() {
                        Some(sequence) => {
                            prop_assert_eq!(sequence, claimed + 1);
                            prop_assert!(sequence - consumed <= size as i64);
                            sequencer.publish(sequence);
                            claimed = sequence;
                        }
                        None => prop_assert_eq!(claimed - consumed, size as i64),
                    },
                    Op::Consume(count) => {
                        consumed = (consumed + i64::from(count)).min(claimed);
                        sequencer.mark_consumed(consumed);
                    }
                }

                let remaining = sequencer.remaining_capacity();
                prop_assert!((0..=size as i64).contains(&remaining));
                prop_assert_eq!(remaining, size as i64 - (claimed - consumed));
                prop_assert_eq!(sequencer.highest_published(), claimed);
            }
        }

        #[test]
        fn close_returns_last_claim(claims in 0usize..16) {
            let sequencer = Sequencer::new(16, Arc::new(WaitStrategy::default())).unwrap();
            for _ in 0..claims {
                sequencer.claim_next().unwrap();
            }
            prop_assert_eq!(sequencer.close(), claims as i64 - 1);
            prop_assert!(sequencer.try_claim_next().is_err());
        }
    }
}

/// Property tests for configuration resolution
mod config_properties {
    use super::*;

    fn resolve(settings: &RouterSettings) -> (RouterConfig, Vec<Diagnostic>) {
        let seen = Mutex::new(Vec::new());
        let sink = |diagnostic: Diagnostic| seen.lock().push(diagnostic);
        let config = RouterConfig::resolve(settings, &sink);
        (config, seen.into_inner())
    }

    /// Spell a name with random case and separators
    fn mangled(name: &'static str) -> impl Strategy<Value = String> {
        prop::collection::vec((any::<bool>(), prop_oneof![Just(""), Just("-"), Just("_")]), name.len())
            .prop_map(move |choices| {
                name.chars()
                    .zip(choices)
                    .map(|(c, (upper, sep))| {
                        let c = if upper { c.to_ascii_uppercase() } else { c };
                        format!("{c}{sep}")
                    })
                    .collect()
            })
    }

    proptest! {
        #[test]
        fn ring_size_is_always_a_power_of_two(requested in 0usize..(1 << 24)) {
            let settings = RouterSettings {
                ring_size: Some(requested),
                ..RouterSettings::default()
            };
            let (config, warnings) = resolve(&settings);

            prop_assert!(config.ring_size.is_power_of_two());
            if requested.is_power_of_two() {
                prop_assert_eq!(config.ring_size, requested);
                prop_assert!(warnings.is_empty());
            } else {
                prop_assert_eq!(warnings.len(), 1);
                if requested > 0 {
                    prop_assert_eq!(config.ring_size, requested.next_power_of_two());
                }
            }
        }

        #[test]
        fn wait_strategy_names_ignore_case_and_separators(name in mangled("busyspin")) {
            let settings = RouterSettings {
                wait_strategy: Some(name),
                ..RouterSettings::default()
            };
            let (config, warnings) = resolve(&settings);
            prop_assert_eq!(config.wait_strategy, WaitStrategyKind::BusySpin);
            prop_assert!(warnings.is_empty());
        }

        #[test]
        fn unknown_wait_strategy_warns_once(name in "[a-z]{12,20}") {
            let settings = RouterSettings {
                wait_strategy: Some(name),
                ..RouterSettings::default()
            };
            let (config, warnings) = resolve(&settings);
            prop_assert_eq!(config.wait_strategy, WaitStrategyKind::Blocking);
            prop_assert_eq!(warnings.len(), 1);
        }
    }
}

/// Property tests for entry storage
mod entry_properties {
    use super::*;
    use std::io::Write;

    proptest! {
        #[test]
        fn payload_never_exceeds_capacity(
            capacity in 0usize..512,
            writes in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..128), 0..16),
        ) {
            let mut payload = Payload::with_capacity(capacity).unwrap();
            let storage = payload.storage_ptr();
            let mut expected = Vec::new();

            for chunk in &writes {
                payload.write_all(chunk).ok();
                expected.extend_from_slice(chunk);
                prop_assert!(payload.len() <= capacity);
            }

            expected.truncate(capacity);
            prop_assert_eq!(payload.as_bytes(), &expected[..]);
            prop_assert_eq!(payload.is_truncated(), writes.iter().map(Vec::len).sum::<usize>() > capacity);
            prop_assert_eq!(payload.storage_ptr(), storage);
        }

        #[test]
        fn parameters_are_capped_at_slot_count(max_parameters in 0usize..8, supplied in 0usize..16) {
            let mut entry = EventEntry::new(max_parameters, 0).unwrap();
            for value in 0..supplied {
                let accepted = entry.push_parameter(value as i64);
                prop_assert_eq!(accepted, value < max_parameters);
            }
            prop_assert_eq!(entry.parameters().len(), supplied.min(max_parameters));

            entry.reset();
            prop_assert!(entry.parameters().is_empty());
            prop_assert_eq!(entry.parameter_capacity(), max_parameters);
        }
    }
}
