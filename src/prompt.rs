use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Single-choice selection, answered by whoever hosts the review
/// (an editor over LSP, or a terminal).
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Returns the index of the chosen item, or `None` when the user dismissed
    /// the prompt.
    async fn pick(&self, placeholder: &str, items: &[String]) -> Option<usize>;
}

/// Picks one of `items`. A single candidate is returned without asking.
///
/// `None` means nothing to choose from or the prompt was cancelled.
pub async fn choose<T>(
    prompter: &dyn Prompter,
    placeholder: &str,
    mut items: Vec<T>,
    label: impl Fn(&T) -> String,
) -> Option<T> {
    match items.len() {
        0 => None,
        1 => items.pop(),
        _ => {
            let labels: Vec<String> = items.iter().map(label).collect();
            let idx = prompter.pick(placeholder, &labels).await?;
            if idx >= items.len() {
                return None;
            }
            Some(items.swap_remove(idx))
        }
    }
}

/// Numbered list on stderr, answer read from stdin. An empty line, EOF or
/// anything that isn't a listed number cancels.
pub struct TerminalPrompter;

#[async_trait]
impl Prompter for TerminalPrompter {
    async fn pick(&self, placeholder: &str, items: &[String]) -> Option<usize> {
        let mut menu = format!("{placeholder}\n");
        for (i, item) in items.iter().enumerate() {
            menu.push_str(&format!("  {}) {item}\n", i + 1));
        }
        menu.push_str("> ");

        let mut stderr = tokio::io::stderr();
        stderr.write_all(menu.as_bytes()).await.ok()?;
        stderr.flush().await.ok()?;

        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .ok()?;
        parse_choice(&line, items.len())
    }
}

fn parse_choice(answer: &str, len: usize) -> Option<usize> {
    let n: usize = answer.trim().parse().ok()?;
    (1..=len).contains(&n).then(|| n - 1)
}
