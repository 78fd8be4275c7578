use clap::{ArgAction, Parser};

use crate::{catalog::DEFAULT_CATALOG_URL, gpt::OpenAIModel};

#[derive(Parser, Debug)]
#[clap(name = "promptchat", version, about = "Chat with OpenAI models from your terminal")]
pub struct Cli {
    /// The initial prompt sent to the model, looked up by its title in the
    /// prompt catalog (see https://github.com/f/awesome-chatgpt-prompts).
    /// ex) Linux Terminal
    #[clap(long = "initial-prompt-title")]
    pub initial_prompt_title: Option<String>,
    /// Choose the initial prompt from the catalog with a fuzzy finder
    #[clap(short = 'p', long = "select-initial-prompt")]
    pub select_initial_prompt: bool,
    #[clap(short = 'm', long = "model", env = "OPENAI_MODEL", default_value = "gpt-3.5-turbo")]
    pub model: OpenAIModel,
    /// Url or file path of the prompt catalog csv
    #[clap(long = "catalog", env = "PROMPT_CATALOG", default_value = DEFAULT_CATALOG_URL)]
    pub catalog: String,
    /// Print more logs to stderr (-v, -vv, -vvv)
    #[clap(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn new() -> Self {
        Self::parse()
    }
    /// Log filter used when `RUST_LOG` is not set.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
