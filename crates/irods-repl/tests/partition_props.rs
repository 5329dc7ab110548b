//! Property tests for cohort partitioning and progress counting.

use irods_repl::progress::ProgressAggregator;
use irods_repl::{partition, Candidate, CohortKind, CohortPolicy, CompletionEvent, NullReporter};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

fn candidates(sizes: &[u64]) -> Vec<Candidate> {
    sizes
        .iter()
        .enumerate()
        .map(|(i, size)| Candidate::new(format!("/zone/home/obj{}", i), *size))
        .collect()
}

fn size_strategy() -> impl Strategy<Value = u64> {
    prop_oneof![
        Just(0u64),
        0u64..4096,
        0u64..(1u64 << 40),
        Just(u64::MAX),
    ]
}

proptest! {
    #[test]
    fn every_candidate_lands_in_exactly_one_cohort(
        sizes in prop::collection::vec(size_strategy(), 0..200),
        buffer in 1u64..10_000,
        max_threads in 1usize..24,
    ) {
        let input = candidates(&sizes);
        let cohorts = partition(input.clone(), &CohortPolicy::new(buffer, max_threads));

        let mut seen = HashSet::new();
        for cohort in &cohorts {
            for member in &cohort.members {
                prop_assert!(seen.insert(member.path.clone()), "{} placed twice", member.path);
            }
        }
        prop_assert_eq!(seen.len(), input.len());
    }

    #[test]
    fn members_respect_cohort_bounds(
        sizes in prop::collection::vec(size_strategy(), 0..200),
        buffer in 1u64..10_000,
        max_threads in 1usize..24,
    ) {
        let cohorts = partition(candidates(&sizes), &CohortPolicy::new(buffer, max_threads));

        for cohort in &cohorts {
            for member in &cohort.members {
                prop_assert!(cohort.contains(member.size));
                if cohort.kind == CohortKind::Sized {
                    prop_assert!(member.size > 0);
                    prop_assert!(member.size >= cohort.min_size);
                    if let Some(max) = cohort.max_size {
                        prop_assert!(member.size < max);
                    }
                }
            }
        }
    }

    #[test]
    fn plan_order_is_fixed(buffer in 1u64..10_000, max_threads in 1usize..24) {
        let cohorts = partition(Vec::new(), &CohortPolicy::new(buffer, max_threads));

        prop_assert_eq!(cohorts.len(), max_threads + 1);
        for (i, cohort) in cohorts.iter().take(max_threads).enumerate() {
            prop_assert_eq!(cohort.kind, CohortKind::Sized);
            prop_assert_eq!(cohort.threads, i + 1);
        }
        prop_assert_eq!(cohorts[max_threads].kind, CohortKind::ZeroByte);
        prop_assert!(cohorts[max_threads - 1].max_size.is_none());
    }

    #[test]
    fn boundary_belongs_to_upper_cohort(band in 1u64..15, buffer in 1u64..10_000) {
        let size = band * buffer;
        let cohorts = partition(candidates(&[size]), &CohortPolicy::new(buffer, 16));
        let owner = cohorts.iter().find(|c| !c.is_empty()).map(|c| c.threads);
        prop_assert_eq!(owner, Some(band as usize + 1));
    }

    #[test]
    fn global_counter_is_monotonic_and_bounded(
        events in prop::collection::vec(0usize..40, 0..200),
        base in 0u64..50,
    ) {
        let members = candidates(&[1; 20]);
        let cohorts = partition(members, &CohortPolicy::new(1024, 1));
        let total = base + 20;
        let mut aggregator = ProgressAggregator::new(&cohorts[0], base, total, Arc::new(NullReporter));

        let mut last = aggregator.global_completed();
        for idx in events {
            // Indices past 19 name objects outside the cohort
            aggregator.record(CompletionEvent::new(format!("/zone/home/obj{}", idx)));
            let now = aggregator.global_completed();
            prop_assert!(now >= last);
            prop_assert!(now <= total);
            last = now;
        }
        prop_assert!(aggregator.cohort_completed() <= 20);
    }
}
