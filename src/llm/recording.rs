//! Session recorder and playback for Vertex exchanges.
//!
//! Recordings are a JSON array of sessions. Each session keeps the request
//! body, the endpoint it was sent to and every received chunk together with
//! its offset from the start of the request.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecordingSession {
    pub request: serde_json::Value,
    /// URL the request went to; older recordings may lack it
    #[serde(default)]
    pub endpoint: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub chunks: Vec<RecordedChunk>,
}

/// Single recorded chunk with timing info
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecordedChunk {
    /// `data` payload of an SSE line, or a whole non-streaming body
    pub data: String,
    /// Milliseconds since recording start
    pub timestamp_ms: u64,
}

struct ActiveSession {
    session: RecordingSession,
    started: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| anyhow!("Recorder state poisoned"))
}

/// Appends exchanges to a recording file
#[derive(Clone)]
pub struct APIRecorder {
    file_path: PathBuf,
    current: Arc<Mutex<Option<ActiveSession>>>,
}

impl APIRecorder {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            file_path: path.as_ref().to_path_buf(),
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Start a new session; call before sending so latency is captured
    pub fn start_recording(&self, request: serde_json::Value, endpoint: &str) -> Result<()> {
        *lock(&self.current)? = Some(ActiveSession {
            session: RecordingSession {
                request,
                endpoint: Some(endpoint.to_string()),
                timestamp: chrono::Utc::now(),
                chunks: Vec::new(),
            },
            started: Instant::now(),
        });
        Ok(())
    }

    pub fn record_chunk(&self, data: &str) -> Result<()> {
        if let Some(active) = lock(&self.current)?.as_mut() {
            let timestamp_ms = active.started.elapsed().as_millis() as u64;
            active.session.chunks.push(RecordedChunk {
                data: data.to_string(),
                timestamp_ms,
            });
        }
        Ok(())
    }

    /// Close the current session and append it to the file
    pub fn end_recording(&self) -> Result<()> {
        let Some(active) = lock(&self.current)?.take() else {
            return Ok(());
        };

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.file_path)
            .with_context(|| {
                format!("Failed to open recording file {}", self.file_path.display())
            })?;

        let json = serde_json::to_string_pretty(&active.session)?;
        let file_size = file.metadata()?.len();
        if file_size == 0 {
            writeln!(file, "[")?;
        } else {
            // Overwrite the closing "\n]\n" of the existing array
            file.set_len(file_size.saturating_sub(3))?;
            file.seek(std::io::SeekFrom::End(0))?;
            writeln!(file, ",")?;
        }
        writeln!(file, "{json}")?;
        writeln!(file, "]")?;
        Ok(())
    }
}

/// Replays recorded sessions in order
#[derive(Clone)]
pub struct PlaybackState {
    sessions: Arc<Vec<RecordingSession>>,
    index: Arc<Mutex<usize>>,
    /// Skip the recorded timing
    pub fast: bool,
}

impl PlaybackState {
    pub fn from_file<P: AsRef<Path>>(path: P, fast: bool) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path.as_ref()).context("Failed to read recording file")?;
        let sessions: Vec<RecordingSession> =
            serde_json::from_str(&contents).context("Failed to parse recording file")?;
        Ok(Self {
            sessions: Arc::new(sessions),
            index: Arc::new(Mutex::new(0)),
            fast,
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Take the next session, or None if exhausted
    pub fn next_session(&self) -> Option<RecordingSession> {
        let mut idx = self.index.lock().ok()?;
        let session = self.sessions.get(*idx)?.clone();
        *idx += 1;
        Some(session)
    }
}
