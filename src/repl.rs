use std::io::{BufRead, Write};

use console::style;
use dialoguer::{theme::ColorfulTheme, FuzzySelect};
use tracing::{debug, info};

use crate::{
    catalog::{CatalogError, CatalogSource},
    gpt::{Completion, Conversation, GptClientError},
};

pub const EXIT_COMMANDS: [&str; 2] = [":exit", ":quit"];
pub const INPUT_PROMPT: &str = "PROMPT> ";

#[derive(Debug, thiserror::Error)]
pub enum ReplError {
    #[error("You can specify one of --initial-prompt-title and --select-initial-prompt, not both")]
    Usage,
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Service(#[from] GptClientError),
    #[error("failed to select an initial prompt: {0}")]
    Selection(#[from] dialoguer::Error),
    #[error("terminal I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
impl ReplError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Usage => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplConfig {
    pub exit_commands: Vec<String>,
    pub input_prompt: String,
}
impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            exit_commands: EXIT_COMMANDS.iter().map(|c| c.to_string()).collect(),
            input_prompt: INPUT_PROMPT.to_string(),
        }
    }
}

pub trait TitleSelector {
    /// Lets the user pick one of `titles`. `None` means nothing was chosen.
    fn select(&mut self, titles: &[String]) -> Result<Option<String>, ReplError>;
}

pub struct FuzzyTitleSelector;
impl TitleSelector for FuzzyTitleSelector {
    fn select(&mut self, titles: &[String]) -> Result<Option<String>, ReplError> {
        let selection = FuzzySelect::with_theme(&ColorfulTheme::default())
            .with_prompt("INITIAL_PROMPT (ex) Linux Terminal)")
            .items(titles)
            .interact_opt()?;
        Ok(selection.and_then(|index| titles.get(index).cloned()))
    }
}

pub struct Repl<C: Completion> {
    conversation: Conversation<C>,
    catalog: Box<dyn CatalogSource>,
    selector: Box<dyn TitleSelector>,
    config: ReplConfig,
}
impl<C: Completion> Repl<C> {
    pub fn new(
        conversation: Conversation<C>,
        catalog: Box<dyn CatalogSource>,
        selector: Box<dyn TitleSelector>,
    ) -> Self {
        Self {
            conversation,
            catalog,
            selector,
            config: ReplConfig::default(),
        }
    }
    pub fn with_config(mut self, config: ReplConfig) -> Self {
        self.config = config;
        self
    }
    pub fn conversation(&self) -> &Conversation<C> {
        &self.conversation
    }
    /// Seeds the conversation if asked to, then chats over `input` line by
    /// line until an exit command or the end of input.
    pub fn run<R: BufRead, W: Write>(
        &mut self,
        initial_prompt_title: Option<&str>,
        select_initial_prompt: bool,
        input: R,
        output: &mut W,
    ) -> Result<(), ReplError> {
        self.print_exit_help(output)?;
        let initial_prompt_title = initial_prompt_title.filter(|title| !title.is_empty());
        if initial_prompt_title.is_some() && select_initial_prompt {
            return Err(ReplError::Usage);
        }
        if let Some(title) = initial_prompt_title {
            let catalog = self.catalog.load()?;
            let prompt = catalog.get(title)?.to_string();
            self.seed(&prompt, output)?;
        }
        if select_initial_prompt {
            let catalog = self.catalog.load()?;
            match self
                .selector
                .select(catalog.titles())?
                .filter(|title| !title.is_empty())
            {
                Some(title) => {
                    let prompt = catalog.get(&title)?.to_string();
                    self.seed(&prompt, output)?;
                }
                None => debug!("no initial prompt selected"),
            }
        }

        self.user_first(output)?;
        for line in input.lines() {
            let line = line?;
            let prompt = line.trim();
            if prompt.is_empty() {
                self.user_first(output)?;
                continue;
            }
            if self.is_exit(prompt) {
                info!(command = prompt, "exit command received");
                return Ok(());
            }
            self.chat(prompt, output)?;
            self.user_first(output)?;
        }
        info!("end of input");
        Ok(())
    }
    fn seed<W: Write>(&mut self, prompt: &str, output: &mut W) -> Result<(), ReplError> {
        self.user_first(output)?;
        writeln!(output, "{}", prompt)?;
        self.chat(prompt, output)
    }
    fn chat<W: Write>(&mut self, prompt: &str, output: &mut W) -> Result<(), ReplError> {
        let mut printed = Ok(());
        let mut started = false;
        // whitespace waits here until more text follows it
        let mut pending = String::new();
        self.conversation.submit(prompt, |delta| {
            // the stored reply is trimmed, so the printed one is trimmed too
            let delta = if started { delta } else { delta.trim_start() };
            if delta.is_empty() || printed.is_err() {
                return;
            }
            started = true;
            let content = delta.trim_end();
            if content.is_empty() {
                pending.push_str(delta);
                return;
            }
            pending.push_str(content);
            printed = Self::gpt_message(output, &pending);
            pending = delta[content.len()..].to_string();
        })?;
        printed?;
        writeln!(output)?;
        Ok(())
    }
    fn is_exit(&self, prompt: &str) -> bool {
        self.config.exit_commands.iter().any(|c| c == prompt)
    }
    fn print_exit_help<W: Write>(&self, output: &mut W) -> std::io::Result<()> {
        let commands = self
            .config
            .exit_commands
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect::<Vec<_>>()
            .join(" or ");
        writeln!(output, "Type {} to exit", commands)
    }
    fn user_first<W: Write>(&self, output: &mut W) -> std::io::Result<()> {
        write!(
            output,
            "{}",
            style(&self.config.input_prompt).cyan().bold()
        )?;
        output.flush()
    }
    fn gpt_message<W: Write>(output: &mut W, message: &str) -> std::io::Result<()> {
        write!(output, "{}", message)?;
        output.flush()
    }
}
