use dnshape::{AddressSpec, Direction, Error, RawParams, Reconciler, RuleConfig, ShapingParams};

use crate::fake::{Dialect, FakeIpfw, Op};

fn shaper(ipfw: &FakeIpfw) -> Reconciler<&FakeIpfw> {
    Reconciler::new(ipfw, RuleConfig::default())
}

fn addr(s: &str) -> AddressSpec {
    s.parse().unwrap()
}

fn example_params() -> RawParams {
    RawParams::new().bandwidth("768000").delay("150").loss("0.0001")
}

#[test]
fn apply_twice_issues_no_mutation() {
    let _ = tracing_subscriber::fmt::try_init();

    for dialect in [Dialect::Legacy, Dialect::Modern] {
        let ipfw = FakeIpfw::new(dialect);
        let shaper = shaper(&ipfw);

        shaper.apply(Direction::Outbound, "1.2.3.4", &example_params()).unwrap();
        let mutations = ipfw.mutations();
        assert_eq!(mutations, 3, "placeholder, queue and rule");

        shaper.apply(Direction::Outbound, "1.2.3.4", &example_params()).unwrap();
        assert_eq!(ipfw.mutations(), mutations, "{dialect:?}: second apply must be a no-op");
    }
}

#[test]
fn apply_then_read_round_trips() {
    let _ = tracing_subscriber::fmt::try_init();

    for dialect in [Dialect::Legacy, Dialect::Modern] {
        let ipfw = FakeIpfw::new(dialect);
        let shaper = shaper(&ipfw);

        shaper.apply(Direction::Outbound, "1.2.3.4", &example_params()).unwrap();

        let snapshot = shaper.read(Direction::Outbound, &addr("1.2.3.4")).unwrap();
        let expected = ShapingParams::new()
            .bandwidth(768_000)
            .delay(150)
            .loss("0.0001".parse().unwrap());
        assert_eq!(snapshot.params(), expected, "{dialect:?}");

        let rule = snapshot.rule.unwrap();
        assert_eq!(rule.queue_id, snapshot.queue.unwrap().queue_id);
        assert_eq!(rule.direction, Direction::Outbound);
    }
}

#[test]
fn apply_unshaped_tears_everything_down() {
    let _ = tracing_subscriber::fmt::try_init();

    let ipfw = FakeIpfw::default();
    let shaper = shaper(&ipfw);

    shaper.apply(Direction::Outbound, "1.2.3.4", &example_params()).unwrap();
    let snapshot = shaper.read(Direction::Outbound, &addr("1.2.3.4")).unwrap();
    let queue_id = snapshot.queue.unwrap().queue_id;

    shaper.apply(Direction::Outbound, "1.2.3.4", &RawParams::new()).unwrap();

    assert!(shaper.read(Direction::Outbound, &addr("1.2.3.4")).unwrap().is_absent());
    assert_eq!(ipfw.pipe(queue_id), None);
    assert!(ipfw.rule_ids().is_empty(), "rule and placeholder must be gone: {:?}", ipfw.rule_ids());

    // Nothing left to remove.
    let mutations = ipfw.mutations();
    shaper.apply(Direction::Outbound, "1.2.3.4", &RawParams::new()).unwrap();
    assert_eq!(ipfw.mutations(), mutations);
}

#[test]
fn zero_values_mean_delete() {
    let ipfw = FakeIpfw::default();
    let shaper = shaper(&ipfw);

    shaper.apply(Direction::Inbound, "1.2.3.4", &example_params()).unwrap();
    shaper
        .apply(Direction::Inbound, "1.2.3.4", &RawParams::new().bandwidth("0").delay("0").loss("0"))
        .unwrap();

    assert!(ipfw.rule_ids().is_empty());
    assert!(ipfw.pipe_ids().is_empty());
}

#[test]
fn wildcard_rules_get_distinct_slots_after_specific_rules() {
    let _ = tracing_subscriber::fmt::try_init();

    let ipfw = FakeIpfw::default();
    let shaper = shaper(&ipfw);

    let params = RawParams::new().delay("5");
    shaper.apply(Direction::Inbound, "", &params).unwrap();
    shaper.apply(Direction::Outbound, "any", &params).unwrap();
    shaper.apply(Direction::Outbound, "1.2.3.4", &RawParams::new().delay("10")).unwrap();
    shaper.apply(Direction::Outbound, "5.6.7.8", &RawParams::new().delay("20")).unwrap();

    let inbound = shaper.read(Direction::Inbound, &AddressSpec::Any).unwrap();
    let outbound = shaper.read(Direction::Outbound, &AddressSpec::Any).unwrap();
    let a = shaper.read(Direction::Outbound, &addr("1.2.3.4")).unwrap();
    let b = shaper.read(Direction::Outbound, &addr("5.6.7.8")).unwrap();

    let wildcards = [inbound.rule.clone().unwrap().rule_id, outbound.rule.clone().unwrap().rule_id];
    assert_eq!(wildcards, [65533, 65534]);
    assert_eq!(shaper.wildcard_rule_id(Direction::Inbound), wildcards[0]);

    // Rules created after the wildcards still get their own numbers, evaluated first.
    let (a_rule, b_rule) = (a.rule.clone().unwrap(), b.rule.clone().unwrap());
    for rule in [&a_rule, &b_rule] {
        assert!(rule.rule_id < wildcards[0], "rule {} is not evaluated first", rule.rule_id);
    }
    assert_ne!(a_rule.rule_id, b_rule.rule_id);

    let queues = [&inbound, &outbound, &a, &b].map(|snapshot| snapshot.queue.clone().unwrap().queue_id);
    for (i, queue) in queues.iter().enumerate() {
        assert!(!queues[i + 1..].contains(queue), "queue {queue} is shared: {queues:?}");
    }
    assert_eq!(a.params().delay, Some(10));
    assert_eq!(b.params().delay, Some(20));

    // Clearing one address leaves the wildcards alone.
    shaper.clear("1.2.3.4").unwrap();
    assert_eq!(shaper.read(Direction::Inbound, &AddressSpec::Any).unwrap(), inbound);
    assert_eq!(shaper.read(Direction::Outbound, &AddressSpec::Any).unwrap(), outbound);
    assert_eq!(shaper.read(Direction::Outbound, &addr("5.6.7.8")).unwrap(), b);
}

#[test]
fn invalid_input_never_reaches_the_backend() {
    let ipfw = FakeIpfw::default();
    let shaper = shaper(&ipfw);

    let err = shaper
        .apply(Direction::Outbound, "1.2.3.4", &RawParams::new().bandwidth("-5"))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidBandwidth(ref bw) if bw == "-5"), "unexpected error: {err:?}");

    let err = shaper.apply(Direction::Outbound, "1.2.3.4", &RawParams::new().delay("1.5")).unwrap_err();
    assert!(matches!(err, Error::InvalidDelay(_)));

    let err = shaper.apply(Direction::Outbound, "1.2.3.4", &RawParams::new().loss("2")).unwrap_err();
    assert!(matches!(err, Error::InvalidLossRate(_)));

    let err = shaper.apply(Direction::Outbound, "1.2.3.999", &example_params()).unwrap_err();
    assert!(matches!(err, Error::InvalidAddress(_)));

    // The placeholder address can't be shaped.
    let err = shaper.apply(Direction::Outbound, "240.0.0.1", &example_params()).unwrap_err();
    assert!(matches!(err, Error::InvalidAddress(_)));
    assert!(err.is_validation());

    assert!(ipfw.calls().is_empty(), "backend was contacted: {:?}", ipfw.calls());
}

#[test]
fn padded_loss_rate_compares_equal() {
    let ipfw = FakeIpfw::new(Dialect::Legacy);
    let shaper = shaper(&ipfw);

    shaper.apply(Direction::Inbound, "1.2.3.4", &RawParams::new().loss("0.0001")).unwrap();

    let queue = shaper.read(Direction::Inbound, &addr("1.2.3.4")).unwrap().queue.unwrap();
    let status = dnshape::ShaperBackend::show_queue(&ipfw, queue.queue_id).unwrap();
    assert!(status.contains("sl.plr 0.000100"), "{status}");

    let configured = ipfw.count(Op::ConfigureQueue);
    shaper.apply(Direction::Inbound, "1.2.3.4", &RawParams::new().loss("0.0001")).unwrap();
    assert_eq!(ipfw.count(Op::ConfigureQueue), configured);
}

#[test]
fn changed_params_update_queue_in_place() {
    let ipfw = FakeIpfw::default();
    let shaper = shaper(&ipfw);

    shaper.apply(Direction::Outbound, "1.2.3.4", &example_params()).unwrap();
    let before = shaper.read(Direction::Outbound, &addr("1.2.3.4")).unwrap();
    let mutations = ipfw.mutations();

    let updated = RawParams::new().bandwidth("1234000").delay("42").loss("0.05");
    shaper.apply(Direction::Outbound, "1.2.3.4", &updated).unwrap();

    assert_eq!(ipfw.mutations(), mutations + 1, "only the queue is reconfigured");
    assert_eq!(ipfw.count(Op::ConfigureQueue), 2);

    let after = shaper.read(Direction::Outbound, &addr("1.2.3.4")).unwrap();
    assert_eq!(after.rule, before.rule, "identifiers are kept");
    assert_eq!(after.params(), updated.parse().unwrap());
}

/// Omitted (or zero) parameters are not sent on update, so the queue keeps whatever value it
/// had for them.
#[test]
fn omitted_params_keep_their_previous_value_on_update() {
    let ipfw = FakeIpfw::default();
    let shaper = shaper(&ipfw);

    shaper
        .apply(Direction::Outbound, "1.2.3.4", &RawParams::new().bandwidth("768000").delay("150"))
        .unwrap();
    shaper.apply(Direction::Outbound, "1.2.3.4", &RawParams::new().bandwidth("512000")).unwrap();

    let params = shaper.read(Direction::Outbound, &addr("1.2.3.4")).unwrap().params();
    assert_eq!(params.bandwidth, Some(512_000));
    assert_eq!(params.delay, Some(150), "delay is left as it was");

    // Since the queue never matches the request, every apply reconfigures it.
    let configured = ipfw.count(Op::ConfigureQueue);
    shaper.apply(Direction::Outbound, "1.2.3.4", &RawParams::new().bandwidth("512000")).unwrap();
    assert_eq!(ipfw.count(Op::ConfigureQueue), configured + 1);
}

#[test]
fn failed_rule_create_is_repaired_by_next_apply() {
    let _ = tracing_subscriber::fmt::try_init();

    let ipfw = FakeIpfw::default();
    let shaper = shaper(&ipfw);

    ipfw.fail_once(Op::AddRule);
    let err = shaper.apply(Direction::Outbound, "1.2.3.4", &example_params()).unwrap_err();
    assert!(matches!(err, Error::BackendCallFailed(_)), "unexpected error: {err:?}");

    // The queue created before the failure is not rolled back.
    assert_eq!(ipfw.pipe_ids().len(), 1);
    assert!(shaper.read(Direction::Outbound, &addr("1.2.3.4")).unwrap().is_absent());

    shaper.apply(Direction::Outbound, "1.2.3.4", &example_params()).unwrap();
    let snapshot = shaper.read(Direction::Outbound, &addr("1.2.3.4")).unwrap();
    assert_eq!(snapshot.params(), example_params().parse().unwrap());

    // The queue and placeholder of the failed attempt are gone.
    assert_eq!(ipfw.pipe_ids(), vec![snapshot.queue.unwrap().queue_id]);
    assert_eq!(ipfw.rule_ids().len(), 2, "one placeholder and one rule: {:?}", ipfw.rule_ids());

    shaper.clear("1.2.3.4").unwrap();
    assert!(ipfw.rule_ids().is_empty(), "leftover rules: {:?}", ipfw.rule_ids());
    assert!(ipfw.pipe_ids().is_empty(), "leftover pipes: {:?}", ipfw.pipe_ids());
}

#[test]
fn failed_rule_create_is_cleaned_up_by_clear() {
    let ipfw = FakeIpfw::default();
    let shaper = shaper(&ipfw);

    ipfw.fail_once(Op::AddRule);
    shaper.apply(Direction::Outbound, "1.2.3.4", &example_params()).unwrap_err();

    shaper.clear("1.2.3.4").unwrap();
    assert!(ipfw.rule_ids().is_empty(), "leftover rules: {:?}", ipfw.rule_ids());
    assert!(ipfw.pipe_ids().is_empty(), "leftover pipes: {:?}", ipfw.pipe_ids());
}

#[test]
fn rule_without_queue_is_rebuilt() {
    let _ = tracing_subscriber::fmt::try_init();

    let ipfw = FakeIpfw::default();
    let shaper = shaper(&ipfw);

    shaper.apply(Direction::Inbound, "1.2.3.4", &example_params()).unwrap();
    let old = shaper.read(Direction::Inbound, &addr("1.2.3.4")).unwrap().rule.unwrap();
    ipfw.remove_pipe(old.queue_id);

    shaper.apply(Direction::Inbound, "1.2.3.4", &example_params()).unwrap();

    // Old rule and placeholder deleted, then a fresh placeholder, queue and rule.
    assert_eq!(ipfw.count(Op::DeleteRule), 2);
    assert_eq!(ipfw.count(Op::DeleteQueue), 0);
    assert_eq!(ipfw.count(Op::ConfigureQueue), 2);

    let snapshot = shaper.read(Direction::Inbound, &addr("1.2.3.4")).unwrap();
    assert_eq!(snapshot.params(), example_params().parse().unwrap());
    assert_eq!(ipfw.rule_ids().len(), 2, "one placeholder and one rule: {:?}", ipfw.rule_ids());
}

#[test]
fn rule_without_queue_is_removed_on_delete() {
    let ipfw = FakeIpfw::default();
    let shaper = shaper(&ipfw);

    shaper.apply(Direction::Inbound, "1.2.3.4", &example_params()).unwrap();
    let rule = shaper.read(Direction::Inbound, &addr("1.2.3.4")).unwrap().rule.unwrap();
    ipfw.remove_pipe(rule.queue_id);

    shaper.apply(Direction::Inbound, "1.2.3.4", &RawParams::new()).unwrap();

    assert!(ipfw.rule_ids().is_empty());
    assert_eq!(ipfw.count(Op::DeleteQueue), 0, "there was no queue to delete");
}

#[test]
fn garbage_confirmation_is_a_protocol_violation() {
    let ipfw = FakeIpfw::default();
    ipfw.print_garbage_confirmation();

    let err = shaper(&ipfw).apply(Direction::Outbound, "1.2.3.4", &example_params()).unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation(_)), "unexpected error: {err:?}");
}

#[test]
fn hardware_addresses_are_shaped_at_layer_two() {
    let ipfw = FakeIpfw::default();
    let shaper = shaper(&ipfw);
    let mac = "00:1b:63:84:45:e6";

    shaper.apply(Direction::Inbound, mac, &RawParams::new().bandwidth("1000000")).unwrap();

    let snapshot = shaper.read(Direction::Inbound, &addr(mac)).unwrap();
    let rule = snapshot.rule.clone().unwrap();
    assert_eq!(ipfw.rule_bodies(rule.rule_id), vec![format!("pipe {} MAC {mac} any in", rule.queue_id)]);
    assert_eq!(snapshot.params().bandwidth, Some(1_000_000));
}

#[test]
fn set_validates_both_directions_first() {
    let ipfw = FakeIpfw::default();
    let shaper = shaper(&ipfw);

    let err = shaper
        .set("1.2.3.4", &example_params(), &RawParams::new().loss("1.5"))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidLossRate(_)));

    let err = shaper
        .set("1.2.3.4", &RawParams::new().delay("soon"), &example_params())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidDelay(_)));

    assert!(ipfw.calls().is_empty());
}

#[test]
fn set_get_and_clear() {
    let _ = tracing_subscriber::fmt::try_init();

    let ipfw = FakeIpfw::default();
    let shaper = shaper(&ipfw);

    shaper
        .set("1.2.3.4", &example_params(), &RawParams::new().bandwidth("unlimited").delay("20"))
        .unwrap();

    let state = shaper.get("1.2.3.4").unwrap();
    assert_eq!(
        state.to_string(),
        "down: bandwidth=768000bit/s delay=150ms loss=0.0001\nup: delay=20ms"
    );
    assert_eq!(state.down.rule.unwrap().direction, Direction::Inbound);

    shaper.clear("1.2.3.4").unwrap();

    let state = shaper.get("1.2.3.4").unwrap();
    assert_eq!(state.to_string(), "down: unshaped\nup: unshaped");
    assert!(ipfw.rule_ids().is_empty());
    assert!(ipfw.pipe_ids().is_empty());
}

#[test]
fn get_rejects_invalid_address() {
    let ipfw = FakeIpfw::default();

    assert!(matches!(shaper(&ipfw).get("not-an-address"), Err(Error::InvalidAddress(_))));
    assert!(matches!(shaper(&ipfw).get("240.0.0.1"), Err(Error::InvalidAddress(_))));
    assert!(ipfw.calls().is_empty());
}
