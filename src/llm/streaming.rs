//! Chunk sources feeding the stream accumulator: a live HTTP body or a
//! recorded session replayed with (or without) its original timing.

use crate::llm::recording::RecordedChunk;
use crate::llm::types::{ApiError, ApiErrorContext};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Response;
use std::time::{Duration, Instant};

#[async_trait]
pub trait ChunkStream: Send {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

pub struct HttpChunkStream {
    response: Response,
}

impl HttpChunkStream {
    pub fn new(response: Response) -> Self {
        Self { response }
    }
}

#[async_trait]
impl ChunkStream for HttpChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        match self.response.chunk().await {
            Ok(chunk) => Ok(chunk.map(|bytes| bytes.to_vec())),
            Err(e) => Err(ApiErrorContext::from(ApiError::NetworkError(format!(
                "HTTP chunk error: {e}"
            )))
            .into()),
        }
    }
}

/// Replays recorded SSE payloads as `data:` lines
pub struct PlaybackChunkStream {
    chunks: std::vec::IntoIter<RecordedChunk>,
    start_time: Instant,
    fast_mode: bool,
}

impl PlaybackChunkStream {
    pub fn new(chunks: Vec<RecordedChunk>, fast_mode: bool) -> Self {
        Self {
            chunks: chunks.into_iter(),
            start_time: Instant::now(),
            fast_mode,
        }
    }
}

#[async_trait]
impl ChunkStream for PlaybackChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(chunk) = self.chunks.next() else {
            return Ok(None);
        };

        if !self.fast_mode {
            let expected = Duration::from_millis(chunk.timestamp_ms);
            let elapsed = self.start_time.elapsed();
            if elapsed < expected {
                tokio::time::sleep(expected - elapsed).await;
            }
        }

        Ok(Some(format!("data: {}\n", chunk.data).into_bytes()))
    }
}
