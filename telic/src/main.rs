//! `telic` CLI: run the loop for one sprint directory.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use telic::core::types::Termination;
use telic::engine::{Engine, EngineDeps, RunReport};
use telic::exit_codes;
use telic::io::checkpoint::StdinCheckpoint;
use telic::io::config::load_config;
use telic::io::git;
use telic::io::invoker::CliAgentInvoker;
use telic::io::services::DefaultProbe;
use telic::io::sprint::Sprint;
use telic::logging;
use telic::scheduler::CommandE2eRunner;

#[derive(Parser)]
#[command(
    name = "telic",
    version,
    about = "Closed-loop autonomous value-delivery engine"
)]
struct Cli {
    /// Sprint directory (must contain VISION.md and PRD.md).
    sprint_dir: PathBuf,

    /// Override the outer-loop iteration cap.
    max_iterations: Option<u32>,
}

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(report) => {
            print_report(&report);
            code_for(report.termination)
        }
        Err(err) => {
            eprintln!("telic: {err:#}");
            ExitCode::from(u8::try_from(exit_codes::INCOMPLETE).unwrap_or(1))
        }
    }
}

fn run(cli: &Cli) -> Result<RunReport> {
    let sprint = Sprint::open(&cli.sprint_dir)?;
    let config = load_config(&sprint.paths.config_path)?;

    let invoker = CliAgentInvoker::new(
        config.agent.command.clone(),
        sprint.paths.root.clone(),
        sprint.paths.invocations_dir.clone(),
        config.agent.output_limit_bytes,
    );
    let probe = DefaultProbe;
    let prompter = StdinCheckpoint;
    let e2e = CommandE2eRunner::new(
        config.e2e.command.clone(),
        Duration::from_secs(config.timeouts.e2e_secs),
        config.agent.output_limit_bytes,
    );
    let vcs = git::detect(&sprint.paths.root);

    let deps = EngineDeps {
        invoker: &invoker,
        probe: &probe,
        prompter: &prompter,
        e2e: &e2e,
        vcs: vcs.as_ref(),
    };
    let mut engine = Engine::new(sprint, config, deps, cli.max_iterations);
    engine.run()
}

fn print_report(report: &RunReport) {
    let verdict = match report.termination {
        Termination::FullSuccess => "full success",
        Termination::PartialSuccess => "partial success",
        Termination::Incomplete => "incomplete",
    };
    println!(
        "telic: {verdict} ({:?}) after {} iterations — {} passed, {} blocked, {} pending",
        report.stop,
        report.iterations,
        report.passed_tests,
        report.blocked_tests,
        report.pending_tests
    );
}

fn code_value(termination: Termination) -> i32 {
    match termination {
        Termination::FullSuccess => exit_codes::FULL_SUCCESS,
        Termination::Incomplete => exit_codes::INCOMPLETE,
        Termination::PartialSuccess => exit_codes::PARTIAL_SUCCESS,
    }
}

fn code_for(termination: Termination) -> ExitCode {
    ExitCode::from(u8::try_from(code_value(termination)).unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sprint_dir_and_optional_cap() {
        let cli = Cli::parse_from(["telic", "./sprints/demo"]);
        assert_eq!(cli.sprint_dir, PathBuf::from("./sprints/demo"));
        assert_eq!(cli.max_iterations, None);

        let cli = Cli::parse_from(["telic", "./sprints/demo", "25"]);
        assert_eq!(cli.max_iterations, Some(25));
    }

    #[test]
    fn terminations_map_to_documented_exit_codes() {
        assert_eq!(code_value(Termination::FullSuccess), 0);
        assert_eq!(code_value(Termination::Incomplete), 1);
        assert_eq!(code_value(Termination::PartialSuccess), 2);
    }
}
