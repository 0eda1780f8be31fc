use super::{open_store, CommandFailure};
use crate::output::{display_path, print_json, print_table};
use specflow_core::{
    config::Config,
    gate::{self, GateEvaluator, GateReport, Severity, Verdict},
    test_runner::{ShellTestRunner, TestRunner},
    types::StepName,
    SpecflowError,
};
use std::path::Path;

pub struct GateOptions {
    pub strict: bool,
    pub record: bool,
    pub run_tests: bool,
}

pub fn run(root: &Path, target: &str, opts: GateOptions, json: bool) -> anyhow::Result<()> {
    let mut store = open_store(root)?;
    let config = Config::load(root)?;
    let runner = if opts.run_tests {
        ShellTestRunner::detect(root, &config)
    } else {
        None
    };
    let runner_ref = runner.as_ref().map(|r| r as &dyn TestRunner);

    let evaluator = GateEvaluator::for_active_phase(root, store.state(), &config)
        .ok_or(SpecflowError::NoActivePhase)?
        .strict(opts.strict);

    match target {
        "status" => {
            let lines = evaluator.status(store.state())?;
            if json {
                return print_json(&serde_json::json!({
                    "phase_dir": display_path(root, evaluator.phase_dir()),
                    "steps": lines,
                }));
            }
            let rows = lines
                .iter()
                .map(|l| {
                    vec![
                        l.step.to_string(),
                        l.recorded.to_string(),
                        l.verdict.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
                    ]
                })
                .collect();
            print_table(&["STEP", "RECORDED", "GATE"], rows);
            Ok(())
        }
        "all" => {
            let summary = evaluator.with_test_runner(runner_ref).evaluate_all()?;
            if !json {
                for report in &summary.reports {
                    print_report(root, report);
                    println!();
                }
                println!("Overall: {}", summary.verdict);
            }
            let recorded = if opts.record {
                Some(gate::record_all(&mut store, &summary.reports))
            } else {
                None
            };
            if json {
                let (statuses, record_error) = match &recorded {
                    Some(Ok(statuses)) => (Some(statuses.clone()), None),
                    Some(Err(e)) => (None, Some(e.to_string())),
                    None => (None, None),
                };
                print_json(&serde_json::json!({
                    "verdict": summary.verdict,
                    "reports": summary.reports,
                    "recorded": statuses,
                    "record_error": record_error,
                }))?;
            } else if let Some(Ok(_)) = &recorded {
                println!("Recorded {} gate result(s).", summary.reports.len());
            }
            if let Some(Err(e)) = recorded {
                return Err(anyhow::Error::new(e).context("no gate results were recorded"));
            }
            finish(summary.verdict, "gates")
        }
        step => {
            let step: StepName = step.parse()?;
            let report = evaluator.with_test_runner(runner_ref).evaluate(step)?;
            let recorded = if opts.record {
                Some(gate::record(&mut store, &report)?)
            } else {
                None
            };
            if json {
                let mut value = serde_json::to_value(&report)?;
                if let Some(status) = recorded {
                    value["recorded"] = serde_json::to_value(status)?;
                }
                print_json(&value)?;
            } else {
                print_report(root, &report);
                if let Some(status) = recorded {
                    println!("  recorded: {step} -> {status}");
                }
            }
            finish(report.verdict, step.as_str())
        }
    }
}

fn finish(verdict: Verdict, what: &str) -> anyhow::Result<()> {
    if verdict == Verdict::Fail {
        return Err(CommandFailure::new(1, format!("{what}: FAIL")));
    }
    Ok(())
}

fn print_report(root: &Path, report: &GateReport) {
    if !report.gated {
        println!("gate {}: {} (not gated)", report.step, report.verdict);
        return;
    }
    println!(
        "gate {}: {} ({} error(s), {} warning(s){})",
        report.step,
        report.verdict,
        report.errors,
        report.warnings,
        if report.strict { ", strict" } else { "" }
    );
    if let Some(artifact) = &report.artifact {
        println!("  artifact: {}", display_path(root, artifact));
    }
    if let Some(tally) = report.tally {
        println!("  tasks:    {tally}");
    }
    if let Some(tests) = &report.tests {
        let result = if tests.passed { "passed" } else { "failed" };
        println!("  tests:    {} {result} ({} ms)", tests.command, tests.duration_ms);
    }
    for finding in &report.findings {
        let tag = match finding.severity {
            Severity::Error => "[error]  ",
            Severity::Warning => "[warning]",
        };
        println!("  {tag} {}", finding.message);
        for sample in &finding.samples {
            println!("      line {}: {}", sample.line, sample.text);
        }
        for line in &finding.context {
            println!("      | {line}");
        }
    }
}
