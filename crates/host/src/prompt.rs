//! Consent prompt answered on the terminal.

use async_trait::async_trait;
use callgate_security::{ConsentPrompt, Origin, PromptOutcome};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

/// Asks on stderr and reads `y`/`n` from a line-oriented reader.
///
/// Anything else, including end of input, counts as a dismissed prompt.
pub struct TerminalPrompt<R> {
    lines: Mutex<Lines<BufReader<R>>>,
}

impl TerminalPrompt<Stdin> {
    pub fn stdin() -> Self {
        Self::new(tokio::io::stdin())
    }
}

impl<R: AsyncRead + Unpin> TerminalPrompt<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: Mutex::new(BufReader::new(reader).lines()),
        }
    }
}

#[async_trait]
impl<R> ConsentPrompt for TerminalPrompt<R>
where
    R: AsyncRead + Unpin + Send + Sync,
{
    async fn show(&self, origin: &Origin, message: &str) -> PromptOutcome {
        // One question on screen at a time.
        let mut lines = self.lines.lock().await;
        eprintln!("[{}] {} [y/n]", origin, message);

        match lines.next_line().await {
            Ok(Some(answer)) => parse_answer(&answer),
            Ok(None) => PromptOutcome::Dismissed,
            Err(err) => {
                tracing::warn!("Failed to read consent answer: {}", err);
                PromptOutcome::Dismissed
            }
        }
    }
}

fn parse_answer(answer: &str) -> PromptOutcome {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => PromptOutcome::Accept,
        "n" | "no" => PromptOutcome::Decline,
        _ => PromptOutcome::Dismissed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Origin {
        Origin::parse("https://phone.example").unwrap()
    }

    #[tokio::test]
    async fn test_answers() {
        let prompt = TerminalPrompt::new(&b"y\n NO \nmaybe\n"[..]);

        assert_eq!(prompt.show(&origin(), "Allow?").await, PromptOutcome::Accept);
        assert_eq!(prompt.show(&origin(), "Allow?").await, PromptOutcome::Decline);
        assert_eq!(prompt.show(&origin(), "Allow?").await, PromptOutcome::Dismissed);
        // End of input.
        assert_eq!(prompt.show(&origin(), "Allow?").await, PromptOutcome::Dismissed);
    }

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("Yes"), PromptOutcome::Accept);
        assert_eq!(parse_answer(""), PromptOutcome::Dismissed);
    }
}
