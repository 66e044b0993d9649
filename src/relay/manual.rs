//! Escape hatch for files too large for any automated relay.

use std::path::Path;

use dialoguer::Input;
use dialoguer::theme::ColorfulTheme;

/// Supplies a public URL the instance can fetch a file from, if one exists.
pub trait ManualUrlSource: Send {
    fn manual_url(&self, local: &Path, size_mb: f64) -> Option<String>;
}

/// Never supplies a URL; oversized uploads fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoManualUrl;

impl ManualUrlSource for NoManualUrl {
    fn manual_url(&self, _local: &Path, _size_mb: f64) -> Option<String> {
        None
    }
}

/// A URL decided up front, e.g. from a command-line flag.
#[derive(Debug, Clone)]
pub struct FixedManualUrl(pub String);

impl ManualUrlSource for FixedManualUrl {
    fn manual_url(&self, _local: &Path, _size_mb: f64) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Asks on the terminal. An empty answer skips.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptManualUrl;

impl ManualUrlSource for PromptManualUrl {
    fn manual_url(&self, local: &Path, size_mb: f64) -> Option<String> {
        let answer: String = Input::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "{} is {size_mb:.2} MB. Public URL to fetch it from (Enter to skip)",
                local.display()
            ))
            .allow_empty(true)
            .interact_text()
            .map_err(|e| tracing::warn!(error = %e, "manual URL prompt failed"))
            .ok()?;
        let answer = answer.trim();
        (!answer.is_empty()).then(|| answer.to_string())
    }
}
