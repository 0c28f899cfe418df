// src/utils/streams.rs
use std::path::Path;

use anyhow::{anyhow, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStream {
    Stdout,
    Stderr,
}

/// Drains one of a child's piped streams into a vector of lines.
///
/// # Arguments
///
/// * `child` - Spawned child with the requested stream piped.
/// * `stream` - Which stream to read.
///
/// # Returns
/// All lines the child wrote to the stream.
pub async fn read_child_output_to_vec(child: &mut Child, stream: ChildStream) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    match stream {
        ChildStream::Stdout => {
            let out = child.stdout.take().ok_or_else(|| anyhow!("Child stdout is not piped"))?;
            let mut reader = LinesStream::new(BufReader::new(out).lines());
            while let Some(line) = reader.next().await {
                lines.push(line?);
            }
        }
        ChildStream::Stderr => {
            let err = child.stderr.take().ok_or_else(|| anyhow!("Child stderr is not piped"))?;
            let mut reader = LinesStream::new(BufReader::new(err).lines());
            while let Some(line) = reader.next().await {
                lines.push(line?);
            }
        }
    }
    Ok(lines)
}

/// Last `n` lines of a captured log file, joined by newlines. Empty when the
/// file is missing.
pub async fn tail_file(path: &Path, n: usize) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => {
            let lines: Vec<&str> = text.lines().collect();
            let start = lines.len().saturating_sub(n);
            lines[start..].join("\n")
        }
        Err(_) => String::new(),
    }
}
