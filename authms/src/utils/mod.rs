pub mod clock;
pub mod normalize;
pub mod password;
pub mod random;

pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use normalize::IdentityNormalizer;
pub use password::{hash_password, verify_password, Password, PasswordHashString};

use service_core::error::AppError;
use std::future::Future;
use std::time::Duration;

/// Runs `fut` under a deadline. Running out of time is an internal failure.
pub async fn with_deadline<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, timeout_ms = limit.as_millis() as u64, "Deadline exceeded");
            Err(AppError::InternalError(anyhow::anyhow!(
                "{}: deadline exceeded",
                operation
            )))
        }
    }
}
