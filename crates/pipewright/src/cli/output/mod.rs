//! Output formatting utilities

use console::{style, Style};

use pipewright_tasks::{Progress, ProgressEvent};

/// Print a success message
pub fn success(message: &str) {
    println!("{} {}", style("✓").green().bold(), message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), message);
}

/// Print a warning message
pub fn warning(message: &str) {
    println!("{} {}", style("!").yellow().bold(), message);
}

/// Print an info message
pub fn info(message: &str) {
    println!("{} {}", style("→").blue(), message);
}

/// Create a styled header
pub fn header(text: &str) -> String {
    style(text).bold().to_string()
}

/// Create a styled key-value line
pub fn key_value(key: &str, value: &str) -> String {
    format!("  {}: {}", style(key).dim(), value)
}

/// Style for paths
pub fn path_style() -> Style {
    Style::new().cyan()
}

/// Prints one line per finished task
pub struct ConsoleProgress {
    verbose: bool,
}

impl ConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl Progress for ConsoleProgress {
    fn report(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Started { task, .. } if self.verbose => {
                println!("  {} {}", style("→").blue(), task);
            }
            ProgressEvent::Progress { task, message } if self.verbose => {
                println!("    {} {}", style(task.to_string()).dim(), message);
            }
            ProgressEvent::Completed {
                task,
                message,
                cached,
            } => {
                let status = if *cached {
                    style("cached").yellow()
                } else {
                    style("done").green()
                };
                println!(
                    "  {} {} [{}] {}",
                    style("✓").green(),
                    task,
                    status,
                    style(message).dim()
                );
            }
            ProgressEvent::Failed { task, message } => {
                eprintln!("  {} {}: {}", style("✗").red().bold(), task, message);
            }
            _ => {}
        }
    }
}
