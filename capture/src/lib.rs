pub mod analysis;
pub mod classifier;
pub mod device;
pub mod encoder;

pub use analysis::{CaptureAnalysisLoop, LoopSettings, LoopStats};
pub use classifier::{Classifier, ClassifyError, HttpClassifier};
pub use device::{Camera, CaptureDevice, DeviceError, DeviceHandle};
