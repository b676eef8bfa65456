use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use hf_hub::{api::tokio::ApiBuilder, Repo, RepoType};
use kiln_core::flux::{WeightFile, WEIGHT_FILES};
use kiln_server::init_tracing;
use tracing::{info, warn};

/// Downloads the FLUX.1-schnell weights into the layout kiln-server loads.
#[derive(Parser, Debug)]
#[command(author, version, about = "Fetch Kiln model weights from the Hugging Face hub")]
struct Args {
    /// Target weights directory
    #[arg(long, env = "KILN_MODEL_PATH", default_value = "./flux-local")]
    output: PathBuf,

    /// Replace files that already exist
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(false);

    let api = ApiBuilder::new()
        .with_progress(true)
        .build()
        .context("failed to create hf hub API")?;

    for file in WEIGHT_FILES {
        let target = args.output.join(file.local);
        if target.is_file() && !args.force {
            info!(file = file.local, "already present, skipping");
            continue;
        }

        let repo = match file.revision {
            Some(revision) => Repo::with_revision(file.repo.to_string(), RepoType::Model, revision.to_string()),
            None => Repo::model(file.repo.to_string()),
        };
        let cached = api
            .repo(repo)
            .get(file.remote)
            .await
            .with_context(|| format!("failed to download {}/{}", file.repo, file.remote))?;
        place(&cached, &target, file).await?;
    }

    info!(output = %args.output.display(), "weights ready");
    Ok(())
}

/// Links the cached blob into place, copying when a link is not possible.
async fn place(cached: &Path, target: &Path, file: WeightFile) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::try_exists(target).await? {
        tokio::fs::remove_file(target).await?;
    }

    // hub cache entries are symlinks into a blob store
    let blob = tokio::fs::canonicalize(cached).await?;
    if let Err(e) = tokio::fs::hard_link(&blob, target).await {
        warn!(file = file.local, "hard link failed ({e}), copying instead");
        tokio::fs::copy(&blob, target)
            .await
            .with_context(|| format!("failed to copy {} to {}", blob.display(), target.display()))?;
    }
    info!(file = file.local, from = file.repo, "placed weight file");
    Ok(())
}
