//! Markdown persistence of finished runs.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::ensemble::EnsembleAnswer;

/// Render a finished run as markdown.
pub fn render_markdown(answer: &EnsembleAnswer) -> String {
    let mut out = String::new();
    out.push_str("# Ensemble Result\n\n");
    out.push_str(&format!("Correlation ID: {}\n\n", answer.correlation_id));
    out.push_str(&format!("## Prompt\n\n{}\n\n", answer.prompt));
    out.push_str("## Individual Responses\n\n");
    for response in &answer.responses {
        out.push_str(&format!("### {}\n\n{}\n\n", response.backend, response.display_text()));
    }
    out.push_str(&format!(
        "## Final Answer\n\nStrategy: {} (refinement model: {}){}\n\n{}\n",
        answer.strategy.as_str(),
        answer.refinement_backend,
        if answer.degraded { ", degraded" } else { "" },
        answer.text
    ));
    out
}

/// Write `answer` to `<directory>/ensemble_<unix-millis>.md`, creating the
/// directory if needed. Returns the file path.
pub fn write_answer(directory: &Path, answer: &EnsembleAnswer) -> io::Result<PathBuf> {
    fs::create_dir_all(directory)?;
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let path = directory.join(format!("ensemble_{millis}.md"));
    fs::write(&path, render_markdown(answer))?;
    tracing::info!(path = %path.display(), "Ensemble result written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::{BackendAnswer, Strategy};
    use crate::resilience::{BackendFailure, FailureKind};

    fn answer() -> EnsembleAnswer {
        EnsembleAnswer {
            correlation_id: "abc".into(),
            prompt: "What is Rust?".into(),
            text: "A systems language.".into(),
            strategy: Strategy::Synthesized,
            refinement_backend: "a/x".into(),
            responses: vec![
                BackendAnswer::new("a/x", Ok("A language.".into())),
                BackendAnswer::new(
                    "b/y",
                    Err(BackendFailure::new(FailureKind::Timeout, "request timeout after 65.0s")),
                ),
            ],
            degraded: false,
        }
    }

    #[test]
    fn test_render_includes_every_backend() {
        let markdown = render_markdown(&answer());
        assert!(markdown.contains("### a/x\n\nA language."));
        assert!(markdown.contains("### b/y\n\nError: request timeout"));
        assert!(markdown.contains("Strategy: synthesized"));
        assert!(markdown.ends_with("A systems language.\n"));
    }

    #[test]
    fn test_write_creates_directory_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested");
        let path = write_answer(&target, &answer()).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("ensemble_") && name.ends_with(".md"));
        assert!(fs::read_to_string(path).unwrap().contains("What is Rust?"));
    }
}
