//! Re-encoding through an external JPEG encoder (mozjpeg's `cjpeg`).
//!
//! The encoder is not embeddable, so each call hands the bitmap over through
//! a pair of scoped temp files:
//!
//! | Step | Detail |
//! |---|---|
//! | Input | uncompressed BMP, `kiln-*.bmp` |
//! | Invocation | `<encoder> -quality Q -progressive -outfile <out> <in>` |
//! | Output | `kiln-*.jpg`, read fully into memory |
//! | Cleanup | both files are removed when their guards drop, on every path |

use std::{
    ffi::OsString,
    io::{self, Cursor},
    path::{Path, PathBuf},
    process::Stdio,
};

use image::{DynamicImage, ImageFormat};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

use crate::{Error, Result};

pub const JPEG_MEDIA_TYPE: &str = "image/jpeg";
pub const DEFAULT_ENCODER: &str = "cjpeg";
pub const DEFAULT_QUALITY: u8 = 85;

/// Compressed bytes plus the media type they are declared as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub media_type: &'static str,
}

/// A resolved, runnable encoder program.
#[derive(Debug, Clone)]
pub struct JpegEncoder {
    program: PathBuf,
    temp_dir: Option<PathBuf>,
}

impl JpegEncoder {
    /// Locates `program` and fails with [`Error::EncoderUnavailable`] if it
    /// cannot be run.
    ///
    /// A bare name is looked up in `PATH` first, then in `extra_dirs`. A name
    /// containing a path separator is used as given.
    pub fn resolve(program: impl AsRef<Path>, extra_dirs: &[PathBuf]) -> Result<Self> {
        let program = program.as_ref();
        let unavailable = |reason: String| Error::EncoderUnavailable {
            program: program.display().to_string(),
            reason,
        };

        if program.as_os_str().is_empty() {
            return Err(unavailable("no encoder program configured".to_string()));
        }

        if program.components().count() > 1 {
            return if is_executable(program) {
                Ok(Self::new(program))
            } else {
                Err(unavailable(format!("{} is not an executable file", program.display())))
            };
        }

        let path_dirs: Vec<PathBuf> = std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).collect())
            .unwrap_or_default();
        let searched = path_dirs.iter().chain(extra_dirs);
        for dir in searched.clone() {
            let candidate = dir.join(program);
            if is_executable(&candidate) {
                return Ok(Self::new(candidate));
            }
        }

        let searched: Vec<OsString> = searched.map(|dir| dir.clone().into_os_string()).collect();
        let searched = std::env::join_paths(searched)
            .map(|joined| joined.to_string_lossy().into_owned())
            .unwrap_or_default();
        Err(unavailable(format!("not found in {searched}")))
    }

    fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            temp_dir: None,
        }
    }

    /// Creates the exchange files under `dir` instead of the system temp dir.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Encodes `image` as a progressive JPEG at `quality` (1-100).
    pub async fn encode(&self, image: &DynamicImage, quality: u8) -> Result<EncodedImage> {
        if !(1..=100).contains(&quality) {
            return Err(Error::invalid_argument(format!(
                "JPEG quality must be between 1 and 100, got {quality}"
            )));
        }

        let mut bitmap = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bitmap), ImageFormat::Bmp)
            .map_err(|e| Error::encoding(format!("failed to serialize bitmap: {e}")))?;

        let input = self.temp_file(".bmp")?;
        let output = self.temp_file(".jpg")?;
        tokio::fs::write(input.path(), &bitmap).await?;
        debug!(
            input = %input.path().display(),
            output = %output.path().display(),
            bytes = bitmap.len(),
            "running encoder"
        );

        let result = Command::new(&self.program)
            .arg("-quality")
            .arg(quality.to_string())
            .arg("-progressive")
            .arg("-outfile")
            .arg(output.path())
            .arg(input.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let stderr = stderr.trim();
            return Err(Error::encoding(if stderr.is_empty() {
                format!("{} exited with {}", self.program.display(), result.status)
            } else {
                format!("{} exited with {}: {stderr}", self.program.display(), result.status)
            }));
        }

        let bytes = tokio::fs::read(output.path()).await?;
        if bytes.is_empty() {
            return Err(Error::encoding(format!(
                "{} produced no output",
                self.program.display()
            )));
        }

        Ok(EncodedImage {
            bytes,
            media_type: JPEG_MEDIA_TYPE,
        })
    }

    fn temp_file(&self, suffix: &str) -> Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("kiln-").suffix(suffix);
        let file = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        Ok(file)
    }

    fn spawn_error(&self, err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => Error::EncoderUnavailable {
                program: self.program.display().to_string(),
                reason: err.to_string(),
            },
            _ => Error::encoding(format!("failed to run {}: {err}", self.program.display())),
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::{write_script, COPYING_ENCODER, FAILING_ENCODER};
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn sample_image() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(20, 30, |x, y| Rgb([x as u8 * 10, y as u8 * 8, 128])))
    }

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn resolves_from_extra_dirs_and_explicit_paths() {
        let bin = TempDir::new().unwrap();
        let script = write_script(bin.path(), "kiln-test-cjpeg", COPYING_ENCODER);

        let by_name = JpegEncoder::resolve("kiln-test-cjpeg", &[bin.path().to_path_buf()]).unwrap();
        assert_eq!(by_name.program(), script);

        let by_path = JpegEncoder::resolve(&script, &[]).unwrap();
        assert_eq!(by_path.program(), script);
    }

    #[test]
    fn missing_encoder_is_reported_as_unavailable() {
        let empty = TempDir::new().unwrap();
        let err = JpegEncoder::resolve("kiln-no-such-encoder", &[empty.path().to_path_buf()]).unwrap_err();
        match err {
            Error::EncoderUnavailable { program, reason } => {
                assert_eq!(program, "kiln-no-such-encoder");
                assert!(reason.contains(&empty.path().display().to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let not_executable = empty.path().join("cjpeg");
        std::fs::write(&not_executable, "").unwrap();
        assert!(matches!(
            JpegEncoder::resolve(&not_executable, &[]),
            Err(Error::EncoderUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn passes_the_fixed_argument_shape() {
        let bin = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let script = write_script(bin.path(), "cjpeg", COPYING_ENCODER);
        let encoder = JpegEncoder::resolve(&script, &[]).unwrap().with_temp_dir(scratch.path());

        let encoded = encoder.encode(&sample_image(), 85).await.unwrap();
        assert_eq!(encoded.media_type, JPEG_MEDIA_TYPE);
        // the copying encoder echoes the BMP back
        assert_eq!(&encoded.bytes[..2], b"BM");

        let args = std::fs::read_to_string(bin.path().join("cjpeg.args")).unwrap();
        let args: Vec<&str> = args.lines().collect();
        assert_eq!(&args[..4], ["-quality", "85", "-progressive", "-outfile"]);
        assert!(args[4].ends_with(".jpg") && args[5].ends_with(".bmp"));
        assert_eq!(entries(scratch.path()), 0);
    }

    #[tokio::test]
    async fn identical_input_encodes_identically() {
        let bin = TempDir::new().unwrap();
        let script = write_script(bin.path(), "cjpeg", COPYING_ENCODER);
        let encoder = JpegEncoder::resolve(&script, &[]).unwrap();

        let first = encoder.encode(&sample_image(), 85).await.unwrap();
        let second = encoder.encode(&sample_image(), 85).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_encoding_error_and_cleans_up() {
        let bin = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let script = write_script(bin.path(), "cjpeg", FAILING_ENCODER);
        let encoder = JpegEncoder::resolve(&script, &[]).unwrap().with_temp_dir(scratch.path());

        let err = encoder.encode(&sample_image(), 85).await.unwrap_err();
        match err {
            Error::Encoding(msg) => assert!(msg.contains("Not a BMP file"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(entries(scratch.path()), 0);
    }

    #[tokio::test]
    async fn encoder_removed_after_resolution_is_unavailable() {
        let bin = TempDir::new().unwrap();
        let script = write_script(bin.path(), "cjpeg", COPYING_ENCODER);
        let encoder = JpegEncoder::resolve(&script, &[]).unwrap();
        std::fs::remove_file(&script).unwrap();

        let err = encoder.encode(&sample_image(), 85).await.unwrap_err();
        assert!(matches!(err, Error::EncoderUnavailable { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn quality_out_of_range_is_rejected() {
        let bin = TempDir::new().unwrap();
        let script = write_script(bin.path(), "cjpeg", COPYING_ENCODER);
        let encoder = JpegEncoder::resolve(&script, &[]).unwrap();

        assert!(encoder.encode(&sample_image(), 0).await.unwrap_err().is_client_error());
        assert!(encoder.encode(&sample_image(), 101).await.unwrap_err().is_client_error());
    }

    #[tokio::test]
    #[ignore] // Requires mozjpeg's cjpeg
    async fn real_cjpeg_produces_a_progressive_jpeg() {
        let encoder = JpegEncoder::resolve(DEFAULT_ENCODER, &[PathBuf::from("/opt/mozjpeg/bin")]).unwrap();
        let encoded = encoder.encode(&sample_image(), DEFAULT_QUALITY).await.unwrap();

        assert_eq!(&encoded.bytes[..2], [0xFF, 0xD8]);
        let decoded = image::load_from_memory(&encoded.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (20, 30));
    }
}
