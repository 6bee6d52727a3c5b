//! Terminal rendering for pipeline answers

use colored::Colorize;
use sage::{PipelineEvent, PipelineResult, ProgressSink, ServiceHealthSnapshot};

/// Output handler for terminal display
pub struct OutputHandler {
    pub markdown_enabled: bool,
}

impl OutputHandler {
    pub fn new(markdown_enabled: bool) -> Self {
        Self { markdown_enabled }
    }

    /// Print the interactive banner
    pub fn print_banner(&self, tier: &str, providers: &[&str]) {
        println!();
        println!("{}", "Sage - ask anything, get a cited answer".bright_cyan().bold());
        println!("{}", "─".repeat(60).dimmed());
        println!("  Tier:      {}", tier.bright_white());
        if providers.is_empty() {
            println!("  Providers: {}", "none configured".yellow());
        } else {
            println!("  Providers: {}", providers.join(" -> ").bright_white());
        }
        println!("  {}", "Type a question, or /help for commands".dimmed());
        println!();
    }

    pub fn print_header(&self, text: &str) {
        println!();
        println!("{}", format!("▶ {}", text).bright_yellow().bold());
        println!("{}", "─".repeat(60).dimmed());
    }

    pub fn print_error(&self, text: &str) {
        eprintln!("{} {}", "✗".bright_red(), text.bright_red());
    }

    pub fn print_warning(&self, text: &str) {
        eprintln!("{} {}", "⚠".bright_yellow(), text.yellow());
    }

    pub fn print_info(&self, text: &str) {
        println!("{} {}", "ℹ".bright_blue(), text);
    }

    /// Print a full answer: content, sources, perspectives, follow-ups
    pub fn print_result(&self, result: &PipelineResult) {
        if result.degraded {
            self.print_warning("Some services were unavailable; this answer uses fallbacks.");
        }

        self.print_content(&result.content);

        if !result.sources.is_empty() {
            self.print_header("Sources");
            for (i, source) in result.sources.iter().enumerate() {
                println!(
                    "{} {}",
                    format!("[{}]", i + 1).bright_cyan(),
                    source.title.bright_white()
                );
                println!("    {}", source.url.dimmed());
            }
        }

        for perspective in &result.perspectives {
            self.print_header(&format!("Perspective: {}", perspective.title));
            if !perspective.description.is_empty() {
                println!("{}", perspective.description.dimmed());
            }
            if perspective.results.is_empty() {
                println!("  {}", "(no results)".dimmed());
            }
            for hit in &perspective.results {
                println!("  • {} {}", hit.title, hit.url.dimmed());
            }
        }

        if !result.videos.is_empty() {
            self.print_header("Videos");
            for video in &result.videos {
                match &video.duration {
                    Some(duration) => println!("  • {} ({}) {}", video.title, duration, video.url.dimmed()),
                    None => println!("  • {} {}", video.title, video.url.dimmed()),
                }
            }
        }

        if !result.follow_up_questions.is_empty() {
            self.print_header("Related");
            for question in &result.follow_up_questions {
                println!("  {} {}", "?".bright_magenta(), question);
            }
        }
        println!();
    }

    pub fn print_health(&self, snapshot: &[ServiceHealthSnapshot]) {
        if snapshot.is_empty() {
            self.print_info("No services contacted yet.");
            return;
        }

        println!();
        println!(
            "{}",
            format!("{:<16} {:<10} {:>9} {:>14}", "Service", "State", "Failures", "Cooldown")
                .bright_white()
                .bold()
        );
        println!("{}", "─".repeat(52).dimmed());
        for service in snapshot {
            let state = if service.is_healthy {
                "healthy".bright_green()
            } else {
                "open".bright_red()
            };
            let cooldown = if service.cooldown_remaining_ms > 0 {
                format!("{}s", service.cooldown_remaining_ms.div_ceil(1000))
            } else {
                "-".to_string()
            };
            println!(
                "{:<16} {:<10} {:>9} {:>14}",
                service.service_name,
                state,
                service.failure_count,
                cooldown.dimmed()
            );
        }
        println!();
    }

    fn print_content(&self, content: &str) {
        println!();
        if self.markdown_enabled {
            for line in content.lines() {
                println!("{}", render_markdown_line(line));
            }
        } else {
            println!("{}", content);
        }
    }
}

/// Basic markdown styling for headers, inline code, and bold text
fn render_markdown_line(line: &str) -> String {
    if let Some(rest) = line.strip_prefix("### ") {
        return rest.bright_yellow().bold().to_string();
    }
    if let Some(rest) = line.strip_prefix("## ") {
        return rest.bright_cyan().bold().to_string();
    }
    if let Some(rest) = line.strip_prefix("# ") {
        return rest.bright_white().bold().underline().to_string();
    }
    if line.starts_with("```") {
        return line.dimmed().to_string();
    }

    let line = style_delimited(line, "`", |code| code.bright_green().to_string());
    style_delimited(&line, "**", |text| text.bold().to_string())
}

fn style_delimited(line: &str, marker: &str, style: impl Fn(&str) -> String) -> String {
    let mut result = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(start) = rest.find(marker) {
        let after = &rest[start + marker.len()..];
        let Some(end) = after.find(marker) else {
            break;
        };
        result.push_str(&rest[..start]);
        result.push_str(&style(&after[..end]));
        rest = &after[end + marker.len()..];
    }
    result.push_str(rest);
    result
}

/// Prints stage and provider progress to stderr while a query runs
pub struct TerminalProgress {
    verbose: bool,
}

impl TerminalProgress {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl ProgressSink for TerminalProgress {
    fn on_status_update(&self, message: &str) {
        eprintln!("{} {}", "…".dimmed(), message.dimmed());
    }

    fn on_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::StageStarted { .. } | PipelineEvent::ProviderSkipped { .. } => {
                self.on_status_update(&event.message())
            }
            PipelineEvent::ProviderAttempt { .. } | PipelineEvent::StageCompleted { .. }
                if self.verbose =>
            {
                self.on_status_update(&event.message())
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_lines_pass_through() {
        colored::control::set_override(false);
        assert_eq!(render_markdown_line("just text"), "just text");
        assert_eq!(render_markdown_line("a `b` and **c**"), "a b and c");
        assert_eq!(render_markdown_line("unclosed `tick"), "unclosed `tick");
        assert_eq!(render_markdown_line("## Heading"), "Heading");
    }

    #[test]
    fn test_style_delimited_applies_to_each_pair() {
        let styled = style_delimited("**a** x **b**", "**", |s| format!("<{s}>"));
        assert_eq!(styled, "<a> x <b>");
    }
}
