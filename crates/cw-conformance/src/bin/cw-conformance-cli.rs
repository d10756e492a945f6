#![forbid(unsafe_code)]

use std::path::PathBuf;

use cw_conformance::{default_fixture_root, run_suite};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut packet_filter: Option<String> = None;
    let mut fixture_root: Option<PathBuf> = None;
    let mut require_green = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--packet-id" => {
                let value = args
                    .next()
                    .ok_or("--packet-id requires a value (e.g. CW-P01)")?;
                packet_filter = Some(value);
            }
            "--fixture-root" => {
                let value = args.next().ok_or("--fixture-root requires a path")?;
                fixture_root = Some(PathBuf::from(value));
            }
            "--require-green" => {
                require_green = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                return Err(format!("unknown argument: {other}").into());
            }
        }
    }

    let root = fixture_root.unwrap_or_else(default_fixture_root);
    let suite = run_suite(&root, packet_filter.as_deref())?;

    for report in &suite.reports {
        if report.passed() {
            println!("PASS {}", report.packet_id);
        } else {
            println!("FAIL {}", report.packet_id);
            for failure in &report.failures {
                println!("  - {failure}");
            }
        }
    }
    println!(
        "{} of {} packets green",
        suite.reports.iter().filter(|r| r.passed()).count(),
        suite.reports.len()
    );

    if require_green && !suite.all_green() {
        return Err("conformance suite is not green".into());
    }
    Ok(())
}

fn print_help() {
    println!("cw-conformance-cli [--packet-id CW-PXX] [--fixture-root PATH] [--require-green]");
    println!();
    println!("Runs the causeway scenario packets and the replay drift gate.");
}
