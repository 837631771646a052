use crate::app::command_support::{
    inspection_runtime, load_process, map_config_err, parse_args, runtime_for_process,
    settings_for,
};
use crate::config::load_inputs_file;
use crate::orchestration::{Decision, ProcessResult, ReviewerDecision, RunOutcome};
use crate::shared::RunId;
use serde_json::Map;
use std::path::Path;

pub fn cmd_run(args: &[String]) -> Result<String, String> {
    let parsed = parse_args(args, &["inputs", "run-id"])?;
    if parsed.positional.len() != 1 {
        return Err(
            "usage: run <process.yaml> [--inputs file.json] [--run-id id] [--settings file]"
                .to_string(),
        );
    }
    let settings = settings_for(&parsed)?;
    let process = load_process(Path::new(&parsed.positional[0]))?;
    let inputs = match parsed.option("inputs") {
        Some(path) => load_inputs_file(Path::new(path)).map_err(map_config_err)?,
        None => Map::new(),
    };
    let inputs = process.prepare_inputs(inputs).map_err(map_config_err)?;
    let runtime = runtime_for_process(settings, &process)?;

    let outcome = match parsed.option("run-id") {
        Some(raw) => {
            let run_id = RunId::parse(raw)?;
            runtime.start_with_run_id(&process, run_id, inputs)
        }
        None => runtime.start(&process, inputs),
    }
    .map_err(|err| err.to_string())?;
    render_outcome(&outcome, runtime.store().run_dir(outcome.run_id.as_str()).as_path())
}

pub fn cmd_resume(args: &[String]) -> Result<String, String> {
    let parsed = parse_args(args, &[])?;
    if parsed.positional.len() != 2 {
        return Err("usage: resume <process.yaml> <run-id> [--settings file]".to_string());
    }
    let settings = settings_for(&parsed)?;
    let process = load_process(Path::new(&parsed.positional[0]))?;
    let runtime = runtime_for_process(settings, &process)?;
    let outcome = runtime
        .resume(&process, &parsed.positional[1])
        .map_err(|err| err.to_string())?;
    render_outcome(&outcome, runtime.store().run_dir(outcome.run_id.as_str()).as_path())
}

pub fn cmd_decide(args: &[String]) -> Result<String, String> {
    let parsed = parse_args(args, &["note", "by"])?;
    if parsed.positional.len() != 3 {
        return Err(
            "usage: decide <run-id> <breakpoint-id> <proceed|abort|retry> [--note text] [--by name]"
                .to_string(),
        );
    }
    let decision = parsed.positional[2]
        .parse::<Decision>()
        .map_err(|err| err.to_string())?;
    let mut reviewer = ReviewerDecision::new(decision);
    if let Some(note) = parsed.option("note") {
        reviewer = reviewer.with_note(note);
    }
    if let Some(by) = parsed.option("by") {
        reviewer = reviewer.with_decided_by(by);
    }

    let runtime = inspection_runtime(settings_for(&parsed)?);
    let record = runtime
        .decide(&parsed.positional[0], &parsed.positional[1], &reviewer)
        .map_err(|err| err.to_string())?;
    Ok(format!(
        "decision recorded\nrun_id={}\nbreakpoint_id={}\ndecision={}",
        record.run_id, record.breakpoint_id, decision
    ))
}

pub fn cmd_status(args: &[String]) -> Result<String, String> {
    let parsed = parse_args(args, &[])?;
    if parsed.positional.len() != 1 {
        return Err("usage: status <run-id> [--settings file]".to_string());
    }
    let runtime = inspection_runtime(settings_for(&parsed)?);
    let status = runtime
        .status(&parsed.positional[0])
        .map_err(|err| err.to_string())?;

    let record = &status.record;
    let mut lines = vec![
        format!("run_id={}", record.run_id),
        format!("process_id={}", record.process_id),
        format!("state={}", record.state),
        format!("executions={}", record.executions),
        format!("effects_completed={}", record.effects_completed),
        format!(
            "current_step={}",
            record.current_step.as_deref().unwrap_or("none")
        ),
        format!(
            "pending_breakpoint={}",
            record.pending_breakpoint.as_deref().unwrap_or("none")
        ),
    ];
    if let Some(progress) = &status.progress {
        lines.push(format!("summary={}", progress.summary));
        lines.push(format!(
            "next_expected_action={}",
            progress.next_expected_action
        ));
    }
    if let Some(reason) = &record.terminal_reason {
        lines.push(format!("terminal_reason={reason}"));
    }
    if let Some(result) = &status.result {
        let success = result
            .get("success")
            .and_then(|value| value.as_bool())
            .unwrap_or(false);
        lines.push(format!("success={success}"));
    }
    Ok(lines.join("\n"))
}

pub fn cmd_breakpoints(args: &[String]) -> Result<String, String> {
    let parsed = parse_args(args, &[])?;
    if parsed.positional.len() != 1 {
        return Err("usage: breakpoints <run-id> [--settings file]".to_string());
    }
    let runtime = inspection_runtime(settings_for(&parsed)?);
    let records = runtime
        .breakpoints(&parsed.positional[0])
        .map_err(|err| err.to_string())?;
    if records.is_empty() {
        return Ok("no breakpoints".to_string());
    }
    Ok(records
        .iter()
        .map(|record| {
            format!(
                "{} state={} decision={} title={}",
                record.breakpoint_id,
                record.state,
                record
                    .decision
                    .map(|decision| decision.as_str())
                    .unwrap_or("none"),
                record.title
            )
        })
        .collect::<Vec<_>>()
        .join("\n"))
}

fn render_outcome(outcome: &RunOutcome, run_dir: &Path) -> Result<String, String> {
    let body = serde_json::to_string_pretty(&outcome.result)
        .map_err(|err| format!("failed to encode result: {err}"))?;
    let mut lines = vec![
        format!("run_id={}", outcome.run_id),
        format!("state={}", outcome.state),
        format!("success={}", outcome.result.is_success()),
        format!("run_dir={}", run_dir.display()),
    ];
    if let ProcessResult::Suspended { breakpoint_id, .. } = &outcome.result {
        lines.push(format!("pending_breakpoint={breakpoint_id}"));
    }
    lines.push(body);
    Ok(lines.join("\n"))
}
