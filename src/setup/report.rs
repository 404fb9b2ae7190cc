use crossterm::style::{Color, Stylize};
use std::io::{self, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Warning,
    Error,
    Info,
}

impl Status {
    fn symbol(self) -> &'static str {
        match self {
            Status::Success => "✓",
            Status::Warning => "⚠",
            Status::Error => "✗",
            Status::Info => "ℹ",
        }
    }

    fn color(self) -> Color {
        match self {
            Status::Success => Color::Green,
            Status::Warning => Color::Yellow,
            Status::Error => Color::Red,
            Status::Info => Color::Blue,
        }
    }
}

/// Prints colored status lines for the preflight checks
pub struct Reporter {
    writer: Box<dyn Write + Send>,
}

impl Reporter {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self { writer }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn status(&mut self, status: Status, message: &str) -> io::Result<()> {
        writeln!(
            self.writer,
            "{} {}",
            status.symbol().with(status.color()),
            message
        )
    }

    pub fn success(&mut self, message: &str) -> io::Result<()> {
        self.status(Status::Success, message)
    }

    pub fn warning(&mut self, message: &str) -> io::Result<()> {
        self.status(Status::Warning, message)
    }

    pub fn error(&mut self, message: &str) -> io::Result<()> {
        self.status(Status::Error, message)
    }

    pub fn info(&mut self, message: &str) -> io::Result<()> {
        self.status(Status::Info, message)
    }

    /// Unstyled text
    pub fn line(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.writer, "{text}")
    }

    pub fn heading(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.writer, "{}", text.bold())
    }

    pub fn blank(&mut self) -> io::Result<()> {
        writeln!(self.writer)?;
        self.writer.flush()
    }
}
