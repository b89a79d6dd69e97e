pub mod classifier;
pub mod controller;
pub mod error;
pub mod image_source;
mod live_loop;
pub mod result;
pub mod state;

pub use classifier::{Classifier, GeminiClassifier};
pub use controller::{AnalyzerController, AnalyzerEvent, AuthGate, HistorySink};
pub use error::AnalysisError;
pub use image_source::{CapturedImage, DeviceImageSource, ImageSource};
pub use result::{AnalysisEvent, AnalysisResult, SensorSample, INVALID_IMAGE_ISSUE};
pub use state::{SessionMode, SessionPhase, SessionState};
