//! Property-based tests for the wire pipeline and bounded queue
//!
//! These tests verify the codec and obfuscation round trips over arbitrary
//! inputs, and the eviction invariant of the bounded queue.

use neuron_core::{analyze_message, BoundedQueue, Envelope, Head, Obfuscator};
use proptest::prelude::*;

/// Generate a field that carries no frame syntax
fn arb_field() -> impl Strategy<Value = String> {
    prop::string::string_regex(r"[a-zA-Z0-9._=+/-]{0,16}").unwrap()
}

fn arb_head() -> impl Strategy<Value = Head> {
    prop_oneof![
        Just(Head::Request),
        Just(Head::Notification),
        Just(Head::Reserved),
    ]
}

fn arb_items() -> impl Strategy<Value = Vec<u32>> {
    prop::collection::vec(any::<u32>(), 0..64)
}

fn arb_envelope() -> impl Strategy<Value = Envelope> {
    (
        arb_field(),
        arb_head(),
        arb_field(),
        prop::collection::vec(arb_field(), 0..6),
    )
        .prop_map(|(id, head, tag, cmds)| Envelope::new(head, tag).with_id(id).with_cmds(cmds))
}

proptest! {
    /// Property: a well-formed envelope decodes to itself
    #[test]
    fn codec_round_trip(envelope in arb_envelope()) {
        let frames = analyze_message(&envelope.encode());
        prop_assert_eq!(frames, vec![Some(envelope)]);
    }

    /// Property: concatenated frames decode in order
    #[test]
    fn codec_batch_preserves_order(envelopes in prop::collection::vec(arb_envelope(), 1..8)) {
        let buffer: String = envelopes.iter().map(Envelope::encode).collect();
        let decoded: Vec<Envelope> = analyze_message(&buffer).into_iter().flatten().collect();
        prop_assert_eq!(decoded, envelopes);
    }

    /// Property: obfuscation is reversible for any byte payload
    #[test]
    fn obfuscation_round_trip(payload in prop::collection::vec(any::<u8>(), 0..512)) {
        let obfuscator = Obfuscator::new("1.4.7");
        let encoded = obfuscator.encode(&payload).expect("encode should succeed");
        let decoded = obfuscator.decode(&encoded).expect("decode should succeed");
        prop_assert_eq!(decoded, Some(payload));
    }

    /// Property: a queue never grows past its capacity and keeps the newest pushes
    #[test]
    fn queue_push_keeps_newest(capacity in 1usize..16, items in arb_items()) {
        let queue = BoundedQueue::with_capacity(capacity);
        for item in &items {
            queue.push(*item);
            prop_assert!(queue.len() <= capacity);
        }
        let start = items.len().saturating_sub(capacity);
        prop_assert_eq!(queue.to_vec(), items[start..].to_vec());
    }

    /// Property: unshift onto a full queue drops the back
    #[test]
    fn queue_unshift_keeps_newest_at_front(capacity in 1usize..16, items in arb_items()) {
        let queue = BoundedQueue::with_capacity(capacity);
        for item in &items {
            queue.unshift(*item);
        }
        let expected: Vec<u32> = items.iter().rev().take(capacity).copied().collect();
        prop_assert_eq!(queue.to_vec(), expected);
    }
}
