//! Agent loop driven end to end through the real process sandbox.
//!
//! Candidates are `sh` scripts so the tests need no Python: the check step is
//! `sh -n` and the run step executes the script with the sample document path.
//! The generator stays scripted.

use std::fs;
use std::path::Path;
use std::time::Duration;

use parsegen::agent::{AgentEvent, RunOutcome, RunReport, RunRequest, RunSettings, run_agent};
use parsegen::cancel::CancelToken;
use parsegen::io::config::{AgentConfig, ParserConfig};
use parsegen::io::sandbox::{ProcessSandbox, SandboxSettings};
use parsegen::io::target::{Target, TargetResolver};
use parsegen::test_support::{STATEMENT_CSV, ScriptedGenerator, statement_json, write_target};

fn sh_sandbox() -> ProcessSandbox {
    ProcessSandbox::new(SandboxSettings {
        check: Some(vec!["sh".into(), "-n".into(), "{source}".into()]),
        run: vec!["sh".into(), "{source}".into(), "{document}".into()],
        driver: None,
        extension: "sh".to_string(),
        entry_point: "parse".to_string(),
        timeout: Duration::from_secs(10),
        output_limit_bytes: 256 * 1024,
    })
}

fn settings(root: &Path, max_attempts: u32) -> RunSettings {
    RunSettings::from_config(&AgentConfig {
        max_attempts,
        parsers_dir: root.join("custom_parsers"),
        state_dir: root.join(".parsegen"),
        parser: ParserConfig {
            language: "sh".to_string(),
            extension: "sh".to_string(),
            ..ParserConfig::default()
        },
        ..AgentConfig::default()
    })
}

fn target(root: &Path) -> Target {
    let data_dir = root.join("data");
    write_target(&data_dir, "icici", STATEMENT_CSV);
    TargetResolver::new(&data_dir, "result.csv", Vec::new())
        .resolve("icici")
        .expect("resolve")
}

fn fenced(source: &str) -> String {
    format!("Here is the parser.\n\n```sh\n{source}```\n")
}

fn run(
    root: &Path,
    generator: &ScriptedGenerator,
    max_attempts: u32,
) -> (RunReport, Vec<String>) {
    let target = target(root);
    let settings = settings(root, max_attempts);
    let mut finished = Vec::new();
    let report = run_agent(
        generator,
        &sh_sandbox(),
        &RunRequest {
            target: &target,
            settings: &settings,
            cancel: &CancelToken::new(),
        },
        &mut |event| {
            if let AgentEvent::AttemptFinished { record, .. } = event {
                let kind = record.verdict.failure().map_or("pass", |f| f.kind());
                finished.push(kind.to_string());
            }
        },
    )
    .expect("run agent");
    (report, finished)
}

/// Faulting candidate, then a reordered table, then the exact table.
#[test]
fn statement_scenario_retries_until_exact_match() {
    let temp = tempfile::tempdir().expect("tempdir");
    let matching = format!("echo '{}'\n", statement_json());
    let reordered = "echo '{\"columns\":[\"date\",\"amount\",\"description\"],\"rows\":\
        [[\"01-08-2024\",100,\"ATM withdrawal\"],[\"02-08-2024\",2500.5,\"Salary\"]]}'\n";
    let generator = ScriptedGenerator::new(vec![
        Ok(fenced("test -r \"$1\"\nno_such_command_parsegen \"$1\"\nexit 1\n")),
        Ok(fenced(reordered)),
        Ok(fenced(&matching)),
    ]);

    let (report, finished) = run(temp.path(), &generator, 3);

    assert_eq!(finished, vec!["runtime_failure", "mismatch", "pass"]);
    let RunOutcome::Success {
        attempt,
        parser_path,
    } = &report.outcome
    else {
        panic!("unexpected outcome {:?}", report.outcome);
    };
    assert_eq!(*attempt, 3);
    assert_eq!(fs::read_to_string(parser_path).expect("read parser"), matching);

    let prompts = generator.prompts();
    assert!(prompts[1].contains("no_such_command_parsegen"));
    assert!(prompts[1].contains("candidate.sh:2"));
    assert!(prompts[2].contains("column order mismatch"));

    let attempt_dir = report.run_dir.join("1");
    for file in ["prompt.md", "response.txt", "candidate.sh", "sandbox.log", "verdict.json"] {
        assert!(attempt_dir.join(file).is_file(), "missing {file}");
    }
}

#[test]
fn exhausted_run_reports_the_last_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    let generator = ScriptedGenerator::repeating(&fenced("if then (\n"), 5);

    let (report, finished) = run(temp.path(), &generator, 2);

    assert_eq!(generator.calls(), 2);
    assert_eq!(finished, vec!["syntax_failure", "syntax_failure"]);
    match &report.outcome {
        RunOutcome::Exhausted {
            attempts,
            last_failure,
        } => {
            assert_eq!(*attempts, 2);
            assert_eq!(last_failure.kind(), "syntax_failure");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    let summary = fs::read_to_string(report.run_dir.join("summary.json")).expect("summary");
    assert!(summary.contains("\"exhausted\""), "{summary}");
}

/// State left behind by one attempt is invisible to the next.
#[test]
fn attempts_do_not_share_state() {
    let temp = tempfile::tempdir().expect("tempdir");
    let first = "echo leftover > marker\nexport PARSEGEN_LEAK=1\necho 'boom' >&2\nexit 1\n";
    let second = format!(
        "if [ -e marker ] || [ -n \"$PARSEGEN_LEAK\" ]; then\n\
         echo 'state leaked' >&2\n\
         exit 1\n\
         fi\n\
         echo '{}'\n",
        statement_json()
    );
    let generator = ScriptedGenerator::new(vec![Ok(fenced(first)), Ok(fenced(&second))]);

    let (report, finished) = run(temp.path(), &generator, 2);

    assert_eq!(finished, vec!["runtime_failure", "pass"]);
    assert!(matches!(report.outcome, RunOutcome::Success { attempt: 2, .. }));
}
