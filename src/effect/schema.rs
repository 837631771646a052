use serde_json::Value;

/// Validates `instance` against a JSON Schema, collecting every violation.
pub fn validate_against_schema(schema: &Value, instance: &Value) -> Result<(), Vec<String>> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|err| vec![format!("invalid output schema: {err}")])?;
    if validator.is_valid(instance) {
        return Ok(());
    }
    let violations = validator
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect::<Vec<_>>();
    Err(violations)
}
