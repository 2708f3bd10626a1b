//! orgmove: migrate related CRM records between orgs and CSV file sets

mod api;
mod cli;
mod config;
mod confirm;
mod data;
mod engine;
mod files;
mod issues;
mod mappings;
mod migration;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;

use crate::api::OrgClient;
use crate::cli::{Cli, Commands, EndpointArg};
use crate::config::MigrationScript;
use crate::confirm::RunOutcome;
use crate::migration::endpoint::Endpoint;
use crate::migration::job::MigrationJob;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            script,
            root,
            source,
            target,
            yes,
        } => {
            let script = MigrationScript::load(&script)?;
            let source = build_endpoint(source, "ORGMOVE_SOURCE")?;
            let target = build_endpoint(target, "ORGMOVE_TARGET")?;
            let mut job = MigrationJob::new(script, source, target, &root, yes)?;
            match job.run().await? {
                RunOutcome::Completed => println!("{}", "Migration completed".green()),
                RunOutcome::Aborted => {
                    println!("{}", "Migration stopped at your request".yellow())
                }
            }
        }
        Commands::Check { script, root } => {
            let script = MigrationScript::load(&script)?;
            let mut job =
                MigrationJob::new(script, Endpoint::Files, Endpoint::Files, &root, true)?;
            let count = job.check_files()?;
            if count == 0 {
                println!("{}", "Source files are well-formed".green());
            } else {
                println!(
                    "{}",
                    format!("{} issue(s) found and reported; repairable defects were fixed", count)
                        .yellow()
                );
            }
        }
    }
    Ok(())
}

fn build_endpoint(arg: EndpointArg, prefix: &str) -> Result<Endpoint> {
    match arg {
        EndpointArg::Files => Ok(Endpoint::Files),
        EndpointArg::Org => Ok(Endpoint::Org(OrgClient::from_env(prefix)?)),
    }
}
