//! Test doubles for the model capability and the external encoder.

use std::{
    hash::{DefaultHasher, Hash, Hasher},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use candle_core::Device;
use image::{DynamicImage, Rgb, RgbImage};

use crate::{ImageModel, Loader};

/// Encoder that records its arguments to `<script>.args` and copies the
/// input file to the output path.
pub const COPYING_ENCODER: &str = r#"#!/bin/sh
printf '%s\n' "$@" > "$0.args"
cp "$6" "$5"
"#;

/// Encoder that always exits 1 after writing partial output.
pub const FAILING_ENCODER: &str = r#"#!/bin/sh
printf '%s\n' "$@" > "$0.args"
printf 'partial' > "$5"
echo "cjpeg: Not a BMP file" >&2
exit 1
"#;

/// Writes an executable shell script named `name` into `dir`.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, body).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod script");
    path
}

/// In-memory model whose output depends only on `(prompt, steps, seed)`,
/// with counters for calls and concurrent use.
#[derive(Clone, Default)]
pub struct FakeModel {
    size: Option<(u32, u32)>,
    delay: Duration,
    failure: Option<String>,
    calls: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl FakeModel {
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.size = Some((width, height));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl ImageModel for FakeModel {
    fn synthesize(&mut self, prompt: &str, steps: usize, seed: Option<u64>) -> anyhow::Result<DynamicImage> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.active.fetch_sub(1, Ordering::SeqCst);

        if let Some(message) = &self.failure {
            anyhow::bail!("{message}");
        }

        let mut hasher = DefaultHasher::new();
        (prompt, steps).hash(&mut hasher);
        // unseeded calls vary from one call to the next
        seed.unwrap_or(u64::MAX - call as u64).hash(&mut hasher);
        let [r, g, b, ..] = hasher.finish().to_le_bytes();

        let (width, height) = self.size.unwrap_or((64, 64));
        Ok(DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([r ^ x as u8, g ^ y as u8, b])
        })))
    }
}

/// Hands out clones of one [`FakeModel`], or fails every load.
pub struct FakeLoader {
    model: FakeModel,
    delay: Duration,
    failure: Option<String>,
    loads: Arc<AtomicUsize>,
}

impl FakeLoader {
    pub fn new(model: FakeModel) -> Self {
        Self {
            model,
            delay: Duration::ZERO,
            failure: None,
            loads: Arc::default(),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::new(FakeModel::default())
        }
    }

    /// Makes every load take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl Loader for FakeLoader {
    type Model = FakeModel;

    async fn load(&self, _weights: &Path, _device: &Device) -> anyhow::Result<Self::Model> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        match &self.failure {
            Some(message) => anyhow::bail!("{message}"),
            None => Ok(self.model.clone()),
        }
    }
}
