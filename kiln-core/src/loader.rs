use std::{future::Future, path::Path};

use anyhow::Result;
use candle_core::Device;

use crate::ImageModel;

/// Builds an [`ImageModel`] from a weights directory on an already selected
/// device.
pub trait Loader: Send + Sync {
    type Model: ImageModel + 'static;

    fn load(
        &self,
        weights: &Path,
        device: &Device,
    ) -> impl Future<Output = Result<Self::Model>> + Send;
}
