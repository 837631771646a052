use procflow::shared::{generate_run_id, BreakpointId, EffectId, RunId, TaskName};

#[test]
fn effect_ids_derive_from_task_and_counter() {
    let task = TaskName::parse("sast-scan").expect("task name");
    assert_eq!(EffectId::from_sequence(&task, 7).as_str(), "0007-sast-scan");
    assert_eq!(EffectId::from_sequence(&task, 12345).as_str(), "12345-sast-scan");
}

#[test]
fn keyed_effect_ids_reject_dots_in_keys() {
    let task = TaskName::parse("scan").expect("task name");
    let keyed = EffectId::from_key(&task, "image-3").expect("keyed id");
    assert_eq!(keyed.as_str(), "k.scan.image-3");

    assert!(EffectId::from_key(&task, "a.b").is_err());
    assert!(EffectId::from_key(&task, "").is_err());
    assert!(EffectId::from_key(&task, "has space").is_err());
}

#[test]
fn identifiers_reject_invalid_characters_and_leading_dots() {
    assert!(TaskName::parse("scan/../etc").is_err());
    assert!(TaskName::parse(".hidden").is_err());
    assert!(RunId::parse("").is_err());
    assert!(RunId::parse("run-1").is_ok());
}

#[test]
fn breakpoint_ids_are_zero_padded() {
    assert_eq!(BreakpointId::from_sequence(1).as_str(), "bp-0001");
    assert_eq!(BreakpointId::from_sequence(42).to_string(), "bp-0042");
}

#[test]
fn generated_run_ids_embed_the_timestamp_and_differ() {
    let first = generate_run_id(1_700_000_000).expect("run id");
    let second = generate_run_id(1_700_000_000).expect("run id");
    assert!(first.as_str().starts_with("run-"));
    let parts = first.as_str().split('-').collect::<Vec<_>>();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[2].len(), 4);
    assert_eq!(parts[1], second.as_str().split('-').nth(1).expect("timestamp part"));

    assert!(generate_run_id(-1).is_err());
}
