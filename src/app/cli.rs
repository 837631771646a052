#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerb {
    Run,
    Resume,
    Decide,
    Status,
    Breakpoints,
    Help,
    Unknown,
}

pub fn parse_cli_verb(input: &str) -> CliVerb {
    match input {
        "run" => CliVerb::Run,
        "resume" => CliVerb::Resume,
        "decide" => CliVerb::Decide,
        "status" => CliVerb::Status,
        "breakpoints" => CliVerb::Breakpoints,
        "help" | "--help" | "-h" => CliVerb::Help,
        _ => CliVerb::Unknown,
    }
}

pub fn cli_help_lines() -> Vec<String> {
    vec![
        "Commands:".to_string(),
        "  run <process.yaml> [--inputs file.json] [--run-id id]".to_string(),
        "                                       Start a run of a process definition".to_string(),
        "  resume <process.yaml> <run-id>       Continue a waiting or interrupted run".to_string(),
        "  decide <run-id> <breakpoint-id> <proceed|abort|retry> [--note text] [--by name]"
            .to_string(),
        "                                       Record a reviewer decision".to_string(),
        "  status <run-id>                      Show run state, progress and result".to_string(),
        "  breakpoints <run-id>                 List breakpoints of a run".to_string(),
        "  help                                 Show this help".to_string(),
        String::new(),
        "Global options:".to_string(),
        "  --settings <file>                    Runtime settings (default: $PROCFLOW_SETTINGS or ./procflow.yaml)"
            .to_string(),
    ]
}

pub(crate) fn help_text() -> String {
    cli_help_lines().join("\n")
}
