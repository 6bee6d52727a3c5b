//! Interactive question loop
//!
//! Every question runs through the same orchestrator, so circuit breaker state
//! carries over between questions for the life of the session.

use std::sync::Arc;

use anyhow::Result;
use colored::Colorize;
use rustyline::{error::ReadlineError, history::DefaultHistory, Editor};
use sage::{PipelineOrchestrator, Tier};

use crate::{ask, output::OutputHandler};

pub struct SageRepl {
    orchestrator: Arc<PipelineOrchestrator>,
    output: OutputHandler,
    editor: Editor<(), DefaultHistory>,
    tier: Tier,
    json: bool,
}

/// What a slash command asks the loop to do next
#[derive(Debug, PartialEq)]
enum Flow {
    Continue,
    Exit,
}

impl SageRepl {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>, output: OutputHandler, tier: Tier, json: bool) -> Result<Self> {
        Ok(Self {
            orchestrator,
            output,
            editor: Editor::new()?,
            tier,
            json,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        self.output
            .print_banner(tier_label(self.tier), &self.orchestrator.provider_names());

        loop {
            let prompt = format!("{} ", format!("sage[{}]>", tier_label(self.tier)).bright_cyan());

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let input = line.trim();
                    if input.is_empty() {
                        continue;
                    }
                    let _ = self.editor.add_history_entry(input);

                    if input.starts_with('/') {
                        if self.handle_command(input) == Flow::Exit {
                            break;
                        }
                        continue;
                    }

                    if let Err(e) = ask(&self.orchestrator, &self.output, input, self.tier, self.json).await {
                        self.output.print_error(&e.to_string());
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!();
                    self.output.print_info("Use /exit to quit.");
                }
                Err(ReadlineError::Eof) => {
                    println!();
                    break;
                }
                Err(e) => {
                    self.output.print_error(&format!("Input error: {}", e));
                    break;
                }
            }
        }

        Ok(())
    }

    fn handle_command(&mut self, input: &str) -> Flow {
        let mut parts = input.split_whitespace();
        let command = parts.next().unwrap_or_default();
        let argument = parts.next();

        match command {
            "/exit" | "/quit" => return Flow::Exit,
            "/help" => self.print_help(),
            "/tier" => match argument.map(str::parse::<Tier>) {
                Some(Ok(tier)) => {
                    self.tier = tier;
                    self.output
                        .print_info(&format!("Tier set to {}", tier_label(tier)));
                }
                Some(Err(e)) => self.output.print_error(&e),
                None => self
                    .output
                    .print_info(&format!("Current tier: {}", tier_label(self.tier))),
            },
            "/health" => self.output.print_health(&self.orchestrator.health().snapshot()),
            "/reset" => match argument {
                Some(service) => {
                    self.orchestrator.health().reset(service);
                    self.output.print_info(&format!("Circuit for '{}' closed", service));
                }
                None => self.output.print_error("Usage: /reset <service>"),
            },
            "/json" => {
                self.json = !self.json;
                self.output
                    .print_info(&format!("JSON output {}", if self.json { "on" } else { "off" }));
            }
            other => self
                .output
                .print_error(&format!("Unknown command '{}'. Type /help for commands.", other)),
        }

        Flow::Continue
    }

    fn print_help(&self) {
        self.output.print_header("Commands");
        println!("  {:<18} {}", "/tier [standard|pro]".bright_white(), "Show or change the research tier");
        println!("  {:<18} {}", "/health".bright_white(), "Show circuit breaker state per service");
        println!("  {:<18} {}", "/reset <service>".bright_white(), "Close the circuit for a service");
        println!("  {:<18} {}", "/json".bright_white(), "Toggle raw JSON output");
        println!("  {:<18} {}", "/exit".bright_white(), "Leave the session");
        println!();
    }
}

pub fn tier_label(tier: Tier) -> &'static str {
    match tier {
        Tier::Standard => "standard",
        Tier::Pro => "pro",
    }
}
