use std::{
    io::{self, BufReader},
    process::ExitCode,
};

use promptchat::{
    catalog::CatalogLocation,
    cli::Cli,
    gpt::{Conversation, GptClient},
    repl::{FuzzyTitleSelector, Repl, ReplError},
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::new();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            debug!(error = ?e, "session terminated");
            eprintln!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(cli: Cli) -> Result<(), ReplError> {
    let client = GptClient::from_env()?;
    let mut repl = Repl::new(
        Conversation::new(client, cli.model),
        Box::new(CatalogLocation::from(cli.catalog)),
        Box::new(FuzzyTitleSelector),
    );
    repl.run(
        cli.initial_prompt_title.as_deref(),
        cli.select_initial_prompt,
        BufReader::new(io::stdin()),
        &mut io::stdout().lock(),
    )
}
