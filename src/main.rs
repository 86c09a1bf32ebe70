use clap::{Parser, Subcommand};
use nutmeg::cli::{self, AggOptions, CliError};
use std::io::{self, Read};

#[derive(Parser)]
#[command(name = "nutmeg")]
#[command(about = "Nutmeg - an embedded JSON document database with an aggregation engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an aggregation pipeline over JSON documents
    Agg {
        /// The pipeline, as a JSON array of stages
        pipeline: String,

        /// JSON input (reads from stdin if not provided)
        #[arg(short, long)]
        input: Option<String>,

        /// Pretty-print the output
        #[arg(short, long)]
        pretty: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Agg { pipeline, input, pretty } => run_agg(pipeline, input, pretty),
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn run_agg(pipeline: String, input: Option<String>, pretty: bool) -> Result<(), CliError> {
    let input = match input {
        Some(s) => Some(s),
        None if !atty::is(atty::Stream::Stdin) => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer).map_err(CliError::Io)?;
            Some(buffer)
        }
        None => None,
    };

    let options = AggOptions {
        pipeline,
        input,
    };

    let results = cli::execute_agg(&options)?;
    let output = serde_json::Value::Array(results);
    let json = if pretty {
        serde_json::to_string_pretty(&output)
    } else {
        serde_json::to_string(&output)
    }
    .map_err(CliError::Json)?;
    println!("{}", json);
    Ok(())
}
