use procflow::orchestration::{
    render_string, render_text, render_value, truthy, TemplateError, TemplateScope,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

fn fixtures() -> (Map<String, Value>, BTreeMap<String, Value>) {
    let mut inputs = Map::new();
    inputs.insert("target".to_string(), json!("api"));
    inputs.insert("depth".to_string(), json!(2));
    let mut steps = BTreeMap::new();
    steps.insert(
        "scan".to_string(),
        json!({ "findings": ["xss", "sqli"], "criticalCount": 1, "passed": true }),
    );
    steps.insert("deep".to_string(), Value::Null);
    (inputs, steps)
}

#[test]
fn whole_placeholders_keep_their_json_type() {
    let (inputs, steps) = fixtures();
    let scope = TemplateScope {
        run_id: "run-1",
        inputs: &inputs,
        steps: &steps,
    };
    assert_eq!(
        render_string("{{steps.scan.findings}}", &scope).expect("findings"),
        json!(["xss", "sqli"])
    );
    assert_eq!(render_string("{{ inputs.depth }}", &scope).expect("depth"), json!(2));
    assert_eq!(render_string("{{steps.scan.findings.1}}", &scope).expect("index"), json!("sqli"));
    assert_eq!(render_string("{{steps.deep}}", &scope).expect("skipped"), Value::Null);
    assert_eq!(
        render_string("{{steps.scan.missing}}", &scope).expect("missing"),
        Value::Null
    );
}

#[test]
fn mixed_text_interpolates_values() {
    let (inputs, steps) = fixtures();
    let scope = TemplateScope {
        run_id: "run-1",
        inputs: &inputs,
        steps: &steps,
    };
    assert_eq!(
        render_text("{{run.id}}: {{inputs.target}} has {{steps.scan.criticalCount}} critical", &scope)
            .expect("text"),
        "run-1: api has 1 critical"
    );
    assert_eq!(
        render_text("deep={{steps.deep}}", &scope).expect("null text"),
        "deep="
    );

    let rendered = render_value(
        &json!({ "target": "{{inputs.target}}", "list": ["{{steps.scan.passed}}", 3] }),
        &scope,
    )
    .expect("value");
    assert_eq!(rendered, json!({ "target": "api", "list": [true, 3] }));
}

#[test]
fn malformed_and_unknown_references_are_errors() {
    let (inputs, steps) = fixtures();
    let scope = TemplateScope {
        run_id: "run-1",
        inputs: &inputs,
        steps: &steps,
    };
    assert!(matches!(
        render_text("open {{inputs.target", &scope),
        Err(TemplateError::Unterminated { .. })
    ));
    assert!(matches!(
        render_string("{{ }}", &scope),
        Err(TemplateError::Empty { .. })
    ));
    assert!(matches!(
        render_string("{{env.HOME}}", &scope),
        Err(TemplateError::UnknownReference { .. })
    ));
    assert_eq!(
        render_string("{{steps.report.text}}", &scope),
        Err(TemplateError::StepNotReached {
            path: "steps.report.text".to_string(),
            step: "report".to_string(),
        })
    );
}

#[test]
fn truthiness_matches_json_emptiness() {
    assert!(!truthy(&Value::Null));
    assert!(!truthy(&json!(false)));
    assert!(!truthy(&json!(0)));
    assert!(!truthy(&json!("")));
    assert!(!truthy(&json!([])));
    assert!(truthy(&json!("no")));
    assert!(truthy(&json!(0.5)));
    assert!(truthy(&json!({ "a": 1 })));
}
