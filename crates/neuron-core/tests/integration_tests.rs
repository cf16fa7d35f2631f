//! Integration tests across the core modules
//!
//! These exercise the path a frame takes between two nodes without any
//! networking: build, obfuscate, deobfuscate, analyze.

use base64::{engine::general_purpose::STANDARD, Engine};
use neuron_core::{
    analyze_bytes, fetch_branch, generate_message, json_to_tree, tree_to_json, Action,
    BoundedQueue, Head, Message, NeuronConfig, Obfuscator, StatusCode, Task, Tree,
};
use std::sync::Arc;

#[test]
fn test_eval_frame_survives_transport_pipeline() {
    let config = NeuronConfig::default();
    let obfuscator = Obfuscator::from_config(&config);

    let payload = STANDARD.encode(r#"{"k":1}"#);
    let frame = generate_message(
        Head::Request,
        "EVAL",
        ["System", "Ping", payload.as_str()],
        Some("req-1"),
    );
    let wire = obfuscator.encode_str(&frame).unwrap();

    let plain = obfuscator.decode(&wire).unwrap().unwrap();
    let frames = analyze_bytes(&plain).unwrap();
    let envelope = frames[0].clone().unwrap();

    assert_eq!(envelope.id(), Some("req-1"));
    assert!(envelope.is(Head::Request, "EVAL"));
    assert_eq!(envelope.cmd(0), Some("System"));
    assert_eq!(envelope.cmd(1), Some("Ping"));
    assert_eq!(STANDARD.decode(envelope.cmd(2).unwrap()).unwrap(), br#"{"k":1}"#.to_vec());
}

#[test]
fn test_reply_payload_carries_message_envelope() {
    let reply = Message::success("Pong").to_json().unwrap();
    let frame =
        generate_message(Head::Notification, "REPLY", [STANDARD.encode(&reply)], Some("req-1"));
    assert_eq!(frame, format!("req-1#!REPLY#{}**", STANDARD.encode(&reply)));

    let decoded = Message::from_json(&reply).unwrap();
    assert_eq!(decoded.code, StatusCode::SUCCESS);
    assert_eq!(decoded.message, "Success");
}

#[test]
fn test_tree_shipped_and_consumed_on_worker() {
    let tree = Tree::new("Job")
        .with_task(
            Task::new("Prepare")
                .with_action(Action::new("Fetch", "Echo", "a"))
                .with_action(Action::new("Parse", "Echo", "b")),
        )
        .with_task(Task::new("Finish").with_action(Action::new("Store", "Echo", "c")));

    let json = tree_to_json(&tree).unwrap();
    let shipped = STANDARD.encode(&json);

    let received = String::from_utf8(STANDARD.decode(shipped).unwrap()).unwrap();
    let hub = BoundedQueue::new();
    hub.push(Arc::new(json_to_tree(&received).unwrap()));

    let mut order = Vec::new();
    while let Some(branch) = fetch_branch(&hub, true) {
        if branch.is_spent() {
            hub.shift();
            continue;
        }
        order.push(branch.action.unwrap().tag);
    }
    assert_eq!(order, vec!["Fetch", "Parse", "Store"]);
    assert!(hub.is_empty());
}
