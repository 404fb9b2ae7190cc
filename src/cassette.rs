//! Rewrites recorded HTTP fixtures so gzip response bodies become plain text.
//!
//! Cassettes are YAML documents with an `interactions` list. Bodies recorded
//! from compressed responses are stored as base64 (usually `!!binary`) gzip
//! data, which makes them unreadable in review.

use crate::setup::Reporter;
use crate::utils::input::Prompter;
use anyhow::{Context, Result};
use base64::engine::{general_purpose, Engine};
use flate2::read::GzDecoder;
use serde_yaml::{Mapping, Value};
use similar::TextDiff;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, thiserror::Error)]
pub enum CassetteError {
    #[error("Invalid glob pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },
    #[error("No files found matching the provided patterns")]
    NoFiles,
}

/// What happened to a single file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Saved,
    Skipped,
    Unchanged,
    Quit,
}

/// Expand (recursive) glob patterns into a sorted, deduplicated file list
pub fn expand_patterns(patterns: &[String], reporter: &mut Reporter) -> Result<Vec<PathBuf>> {
    let mut files = BTreeSet::new();
    for pattern in patterns {
        let entries = glob::glob(pattern).map_err(|source| CassetteError::Pattern {
            pattern: pattern.clone(),
            source,
        })?;
        let before = files.len();
        let mut matched = false;
        for entry in entries {
            match entry {
                Ok(path) => {
                    matched = true;
                    files.insert(path);
                }
                Err(e) => debug!("Skipping unreadable glob entry: {e}"),
            }
        }
        if !matched {
            reporter.warning(&format!("No files matched: {pattern}"))?;
        } else {
            debug!("{pattern} matched {} new file(s)", files.len() - before);
        }
    }
    Ok(files.into_iter().collect())
}

/// Base64 text of a body, if it is stored as a plain or `!!binary` string
fn encoded_body(value: &Value) -> Option<&str> {
    match value {
        Value::String(text) => Some(text),
        Value::Tagged(tagged) if tagged.tag.to_string().ends_with("binary") => {
            tagged.value.as_str()
        }
        _ => None,
    }
}

fn gunzip_body(encoded: &str) -> Option<String> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = general_purpose::STANDARD.decode(compact).ok()?;
    if !bytes.starts_with(&GZIP_MAGIC) {
        return None;
    }

    let mut text = String::new();
    match GzDecoder::new(bytes.as_slice()).read_to_string(&mut text) {
        Ok(_) => Some(text),
        Err(e) => {
            debug!("Body looks gzipped but does not decompress: {e}");
            None
        }
    }
}

fn remove_content_encoding(headers: &mut Mapping) {
    let keys: Vec<Value> = headers
        .keys()
        .filter(|key| {
            key.as_str()
                .is_some_and(|key| key.eq_ignore_ascii_case("content-encoding"))
        })
        .cloned()
        .collect();
    for key in keys {
        headers.remove(&key);
    }
}

/// Decompress every gzip response body in a cassette.
///
/// Returns the rewritten YAML and how many bodies changed, or `None` if the
/// document has nothing to decompress.
pub fn decompress_document(yaml: &str) -> Result<Option<(String, usize)>> {
    let mut doc: Value = serde_yaml::from_str(yaml).context("Error parsing YAML")?;

    let mut rewritten = 0;
    let interactions = doc
        .get_mut("interactions")
        .and_then(Value::as_sequence_mut);
    for interaction in interactions.into_iter().flatten() {
        let Some(response) = interaction.get_mut("response") else {
            continue;
        };
        let Some(body) = response.get_mut("body").and_then(|body| body.get_mut("string")) else {
            continue;
        };
        let Some(text) = encoded_body(body).and_then(gunzip_body) else {
            continue;
        };
        *body = Value::String(text);
        rewritten += 1;

        if let Some(headers) = response.get_mut("headers").and_then(Value::as_mapping_mut) {
            remove_content_encoding(headers);
        }
    }

    if rewritten == 0 {
        return Ok(None);
    }
    let output = serde_yaml::to_string(&doc).context("Error serializing YAML")?;
    Ok(Some((output, rewritten)))
}

/// Show the diff for one cassette and let the user decide whether to save it
pub fn process_file(
    path: &Path,
    prompter: &mut dyn Prompter,
    reporter: &mut Reporter,
) -> Result<FileOutcome> {
    let original = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let Some((rewritten, count)) = decompress_document(&original)? else {
        reporter.info(&format!("No gzip bodies found in {}", path.display()))?;
        return Ok(FileOutcome::Unchanged);
    };
    reporter.success(&format!(
        "Decompressed {count} response body(ies) in {}",
        path.display()
    ))?;

    let name = path.display().to_string();
    let rule = "=".repeat(80);
    reporter.line(&format!("\n{rule}\nFile: {name}\n{rule}\n"))?;
    let diff = TextDiff::from_lines(&original, &rewritten)
        .unified_diff()
        .header(&format!("{name} (original)"), &format!("{name} (decompressed)"))
        .to_string();
    reporter.line(&diff)?;

    loop {
        let answer = prompter.ask("\n[y]es / [n]o / [q]uit? ")?;
        match answer.as_deref().map(|a| a.trim().to_ascii_lowercase()).as_deref() {
            Some("y" | "yes") => {
                std::fs::write(path, &rewritten)
                    .with_context(|| format!("Failed to write {name}"))?;
                reporter.success(&format!("Saved {name}"))?;
                return Ok(FileOutcome::Saved);
            }
            Some("n" | "no") => {
                reporter.error(&format!("Skipped {name}"))?;
                return Ok(FileOutcome::Skipped);
            }
            Some("q" | "quit") | None => {
                reporter.info("Exiting...")?;
                return Ok(FileOutcome::Quit);
            }
            Some(_) => {}
        }
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    )
}

/// Process every cassette matching `patterns`; returns how many were saved
pub fn run(
    patterns: &[String],
    prompter: &mut dyn Prompter,
    reporter: &mut Reporter,
) -> Result<usize> {
    let files = expand_patterns(patterns, reporter)?;
    if files.is_empty() {
        reporter.error("No files found matching the provided patterns")?;
        return Err(CassetteError::NoFiles.into());
    }
    reporter.line(&format!("Found {} file(s) to process\n", files.len()))?;

    let mut modified = 0;
    for path in &files {
        if !path.exists() {
            reporter.error(&format!("File not found: {}", path.display()))?;
            continue;
        }
        if !is_yaml(path) {
            reporter.warning(&format!(
                "Skipping {} (not a .yaml/.yml file)",
                path.display()
            ))?;
            continue;
        }

        match process_file(path, prompter, reporter) {
            Ok(FileOutcome::Saved) => modified += 1,
            Ok(FileOutcome::Quit) => break,
            Ok(_) => {}
            Err(e) => reporter.error(&format!("Error processing {}: {e:#}", path.display()))?,
        }
        reporter.blank()?;
    }

    let rule = "=".repeat(80);
    reporter.line(&format!("\n{rule}\nSummary: {modified} file(s) modified\n{rule}"))?;
    Ok(modified)
}
