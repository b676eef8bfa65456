pub mod device_map;
pub mod encoder;
pub mod error;
pub mod flux;
pub mod imaging;
pub mod lifecycle;
pub mod loader;
pub mod orchestrator;
mod util;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use device_map::*;
pub use encoder::*;
pub use error::{Error, Result};
pub use flux::FluxLoader;
pub use imaging::*;
pub use lifecycle::*;
pub use loader::*;
pub use orchestrator::*;
pub use util::*;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of a generation call. Checked by [`GenerationRequest::validate`]
/// before any model work starts.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    #[serde(default)]
    pub prompt: String,
    /// Kept as raw JSON so that out-of-range or non-integer seeds fail
    /// validation instead of deserialization.
    #[serde(default)]
    pub seed: Option<Value>,
}

/// The generative model capability.
pub trait ImageModel: Send {
    /// Renders `prompt` with `steps` denoising steps. With a `seed` the output
    /// is reproducible for the same prompt, steps, weights and device.
    fn synthesize(&mut self, prompt: &str, steps: usize, seed: Option<u64>) -> anyhow::Result<DynamicImage>;
}
