//! Property-based tests for runtime helpers

use neuron_runtime::scheduler::{retime, select_next, Retiming};
use neuron_runtime::server::request_params;
use proptest::prelude::*;
use std::time::Duration;
use url::form_urlencoded;

fn arb_frame() -> impl Strategy<Value = String> {
    "[A-Za-z0-9#?!~*+/= ]{1,64}"
}

proptest! {
    #[test]
    fn prop_select_next_visits_every_index(len in 1usize..32) {
        let mut seen = vec![false; len];
        let mut last = None;
        for _ in 0..len {
            let index = select_next(len, last).unwrap();
            prop_assert!(index < len);
            seen[index] = true;
            last = Some(index);
        }
        prop_assert!(seen.into_iter().all(|visited| visited));
        prop_assert_eq!(select_next(len, last), Some(0));
    }

    #[test]
    fn prop_adaptive_wait_never_exceeds_interval(millis in 1u64..10_000, slices in 0u32..1_000) {
        let interval = Duration::from_millis(millis);
        prop_assert!(retime(interval, slices, Retiming::Adaptive) <= interval);
        prop_assert_eq!(retime(interval, slices, Retiming::Fixed), interval);
    }

    #[test]
    fn prop_enqueue_parameters_survive_encoding(
        target in "[A-Za-z0-9-]{0,16}",
        frame in arb_frame(),
    ) {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("neuronId", &target)
            .append_pair("message", &frame)
            .finish();
        let from_query = request_params(&query, b"");
        prop_assert_eq!(from_query.get("neuronId"), Some(&target));
        prop_assert_eq!(from_query.get("message"), Some(&frame));

        let from_body = request_params("", query.as_bytes());
        prop_assert_eq!(from_query, from_body);
    }
}
