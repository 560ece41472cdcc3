/// Reserved words that end the session from the prompt.
pub const EXIT_WORDS: &[&str] = &["q", "quit", "exit"];

/// Something the human sent to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserInput {
    Line(String),
    /// Stop autonomous work at the next checkpoint.
    Interrupt,
    Exit,
}

impl UserInput {
    /// Classify a typed line.
    pub fn from_line(line: &str) -> Self {
        let trimmed = line.trim();
        if EXIT_WORDS.contains(&trimmed.to_lowercase().as_str()) {
            UserInput::Exit
        } else {
            UserInput::Line(trimmed.to_string())
        }
    }
}
