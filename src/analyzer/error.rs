use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-cycle analysis failures. One of these ends the cycle that produced
/// it; none are retried automatically. Upload-mode errors stay until an
/// explicit reset, live-mode errors are replaced by the next cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum AnalysisError {
    #[error("Could not read the selected file: {0}")]
    Read(String),

    #[error("Live feed capture failed: {0}")]
    Capture(String),

    #[error("The classifier returned an empty response.")]
    EmptyResponse,

    #[error("The classifier returned an invalid response format: {0}")]
    MalformedResponse(String),

    /// Transport and provider-side failures. The user-facing message stays
    /// generic; provider detail is logged at the call site.
    #[error(
        "Failed to analyze the image. The classifier could not be reached \
         or failed to process the request."
    )]
    Provider,
}
