//! Copying log selections to the system clipboard.

use anyhow::{Context, Result};

/// Puts `text` on the clipboard and returns how many chars were copied.
pub fn copy_text(text: &str) -> Result<usize> {
    let mut clipboard = arboard::Clipboard::new().context("failed to access clipboard")?;
    clipboard
        .set_text(text.to_string())
        .context("failed to set clipboard text")?;
    let chars = text.chars().count();
    tracing::debug!(chars, "copied log selection");
    Ok(chars)
}

/// Status line shown after a copy attempt.
pub fn copy_feedback(result: &Result<usize>) -> String {
    match result {
        Ok(chars) => format!("copied {} chars", chars),
        Err(err) => format!("clipboard failed: {:#}", err),
    }
}
