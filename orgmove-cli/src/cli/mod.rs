//! Command-line surface

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "orgmove", version, about = "Migrate related CRM records between orgs and CSV file sets")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a migration described by a script
    Run {
        /// Path to the migration script (JSON)
        script: PathBuf,
        /// Working directory holding the source/ and target/ file sets
        #[arg(long, default_value = ".")]
        root: PathBuf,
        /// Where records are read from
        #[arg(long, value_enum, default_value_t = EndpointArg::Files)]
        source: EndpointArg,
        /// Where records are written to
        #[arg(long, value_enum, default_value_t = EndpointArg::Org)]
        target: EndpointArg,
        /// Answer yes to every confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Validate and repair the source files without contacting any org
    Check {
        /// Path to the migration script (JSON)
        script: PathBuf,
        /// Working directory holding the source/ file set
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
}

/// Kind of endpoint on one side of the migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EndpointArg {
    /// A live org, connected via <PREFIX>_URL and <PREFIX>_TOKEN
    Org,
    /// The CSV files under the working directory
    Files,
}
