use std::io::{self, Write};

use anyhow::Result;
use livecheck_core::{AggregatedIdentity, Comparison, LivenessVerdict, SkipReason};
use serde::Serialize;
use serde_json::json;

use crate::cli::OutputMode;
use crate::commands::{CompareReport, PlanReport};

fn write_json<T: Serialize>(value: &T) -> Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    serde_json::to_writer(&mut handle, value)?;
    handle.write_all(b"\n")?;
    Ok(())
}

pub fn render_plan(report: &PlanReport, mode: OutputMode) -> Result<()> {
    match mode {
        OutputMode::Json => write_json(report),
        OutputMode::Human => {
            let plan = &report.plan;
            println!(
                "Sampling {} frames from a {:.2} s clip at {}",
                plan.timestamps.len(),
                plan.duration_secs,
                plan.resolution
            );
            for (index, ts) in plan.timestamps.iter().enumerate() {
                println!("  #{index:<3} {ts:.3} s");
            }
            if let Some(extracted) = report.extracted {
                println!("Decoded {extracted} of {} frames", plan.timestamps.len());
            }
            Ok(())
        }
    }
}

fn verdict_lines(label: &str, verdict: &LivenessVerdict) {
    println!(
        "{label}: {} ({}/4 checks passed, {} of {} frames with a face)",
        if verdict.is_live { "live" } else { "NOT live" },
        verdict.passed_checks(),
        verdict.valid_frame_count,
        verdict.total_frames
    );
    for (check, result) in &verdict.checks {
        println!(
            "  {:<18} {}  metric {:.4}  threshold {:.4}",
            check.as_str(),
            if result.passed { "pass" } else { "FAIL" },
            result.raw_metric,
            result.threshold
        );
    }
}

pub fn render_liveness(verdict: &LivenessVerdict, mode: OutputMode) -> Result<()> {
    match mode {
        OutputMode::Json => write_json(verdict),
        OutputMode::Human => {
            verdict_lines("Liveness", verdict);
            println!("  mean confidence    {:.4}", verdict.mean_confidence);
            Ok(())
        }
    }
}

pub fn render_aggregate(identity: &AggregatedIdentity, mode: OutputMode) -> Result<()> {
    match mode {
        OutputMode::Json => write_json(identity),
        OutputMode::Human => {
            println!(
                "Aggregated {} frames into a {}-d identity vector",
                identity.source_frame_count,
                identity.vector.dim()
            );
            Ok(())
        }
    }
}

pub fn render_compare(report: &CompareReport, mode: OutputMode) -> Result<()> {
    match mode {
        OutputMode::Json => write_json(report),
        OutputMode::Human => {
            if let Some(verdict) = &report.probe_liveness {
                verdict_lines("Probe", verdict);
            }
            if let Some(verdict) = &report.reference_liveness {
                verdict_lines("Reference", verdict);
            }
            match &report.comparison {
                Comparison::Evaluated(result) => println!(
                    "{} (similarity {:.4}, threshold {:.4})",
                    if result.is_match { "Match" } else { "No match" },
                    result.similarity,
                    result.threshold_used
                ),
                Comparison::Skipped { reason } => {
                    let who = match reason {
                        SkipReason::ProbeNotLive => "probe",
                        SkipReason::ReferenceNotLive => "reference",
                        SkipReason::BothNotLive => "probe and reference",
                    };
                    println!("Comparison skipped: {who} failed liveness");
                }
                Comparison::NotRequested => {}
            }
            Ok(())
        }
    }
}

pub fn render_error(err: &anyhow::Error, kind: &str, mode: OutputMode) {
    match mode {
        OutputMode::Human => {
            eprintln!("error: {err}");
            for cause in err.chain().skip(1) {
                eprintln!("cause: {cause}");
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "success": false,
                "kind": kind,
                "error": format!("{err:#}"),
            });
            println!("{payload}");
        }
    }
}
