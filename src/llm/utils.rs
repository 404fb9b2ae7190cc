use crate::llm::types::{ApiError, ApiErrorContext};
use crate::llm::{StreamingCallback, StreamingChunk};
use anyhow::Result;
use reqwest::{Response, StatusCode};
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Upper bound for a server-provided retry hint
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// `retry-after` in seconds, as sent with 429 responses
fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

/// Pass successful responses through, turn everything else into an [`ApiErrorContext`]
pub async fn check_response_error(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(&response);
    let response_text = response
        .text()
        .await
        .map_err(|e| ApiErrorContext::from(ApiError::NetworkError(e.to_string())))?;

    let error = match status {
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimit(response_text),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ApiError::Authentication(response_text)
        }
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => ApiError::InvalidRequest(response_text),
        status if status.as_u16() == 529 => ApiError::Overloaded(response_text),
        status if status.is_server_error() => ApiError::ServiceError(response_text),
        _ => ApiError::Unknown(format!("Status {status}: {response_text}")),
    };

    Err(ApiErrorContext { error, retry_after }.into())
}

fn backoff(attempts: u32) -> Duration {
    Duration::from_secs(2u64.pow(attempts.min(5)))
}

/// Decide whether `error` warrants another attempt and wait accordingly.
/// Returns false when the retry loop should give up.
pub async fn handle_retryable_error(
    error: &anyhow::Error,
    attempts: u32,
    max_retries: u32,
    streaming_callback: Option<&StreamingCallback>,
) -> bool {
    let Some(ctx) = error.downcast_ref::<ApiErrorContext>() else {
        return false;
    };
    if attempts >= max_retries {
        return false;
    }

    let delay = match &ctx.error {
        ApiError::RateLimit(_) => {
            let delay = ctx.retry_after.unwrap_or_else(|| backoff(attempts));
            warn!(
                "Rate limit hit (attempt {}/{}), waiting {} seconds before retry",
                attempts + 1,
                max_retries,
                delay.as_secs()
            );
            if let Some(callback) = streaming_callback {
                let _ = callback(&StreamingChunk::RateLimit {
                    seconds_remaining: delay.as_secs(),
                });
            }
            delay
        }
        ApiError::ServiceError(_) | ApiError::NetworkError(_) | ApiError::Overloaded(_) => {
            let delay = backoff(attempts);
            warn!(
                "Error: {} (attempt {}/{}), retrying in {} seconds",
                error,
                attempts + 1,
                max_retries,
                delay.as_secs()
            );
            delay
        }
        _ => return false,
    };

    sleep(delay).await;
    true
}
