// download.rs — Fetches a sentence-transformers checkpoint from the Hugging Face hub.
//
// Files are cached under ~/.cache/embed-export/models/<org>--<name>/ and reused on later runs.
// Every downloaded file is logged with its SHA256 and written atomically (.tmp + rename).

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use sha2::{Digest, Sha256};

use crate::config::{self, ModelSource};
use crate::model::loader::ModuleLayout;

/// Return a local directory holding the checkpoint, downloading it first when needed.
pub fn resolve_model(source: &ModelSource, cache_dir: Option<&Path>) -> anyhow::Result<PathBuf> {
    match source {
        ModelSource::Local(dir) => {
            if !dir.is_dir() {
                bail!("model directory {} does not exist", dir.display());
            }
            log::info!("Using local checkpoint at {}", dir.display());
            Ok(dir.clone())
        }
        ModelSource::Hub { id, revision } => {
            let root = match cache_dir {
                Some(dir) => dir.to_path_buf(),
                None => dirs_home()?.join(config::model::CACHE_DIR_REL),
            };
            let dir = model_cache_dir(&root, id);
            ensure_model_files(id, revision, &dir)?;
            Ok(dir)
        }
    }
}

/// `org/name` maps to `<root>/org--name`.
pub fn model_cache_dir(root: &Path, model_id: &str) -> PathBuf {
    root.join(model_id.replace('/', "--"))
}

/// Check if all files the loader needs are already cached.
pub fn model_files_exist(dir: &Path) -> anyhow::Result<bool> {
    if !dir.join(config::model::MODULES_FILE).exists() {
        return Ok(false);
    }
    let layout = ModuleLayout::read(dir)?;
    let encoder_dir = dir.join(&layout.transformer_dir);
    Ok(encoder_dir.join(config::model::CONFIG_FILE).exists()
        && encoder_dir.join(config::model::TOKENIZER_FILE).exists()
        && (encoder_dir.join(config::model::SAFETENSORS_FILE).exists()
            || encoder_dir.join(config::model::PYTORCH_FILE).exists())
        && dir.join(&layout.pooling_dir).join(config::model::CONFIG_FILE).exists())
}

fn ensure_model_files(model_id: &str, revision: &str, dir: &Path) -> anyhow::Result<()> {
    if model_files_exist(dir)? {
        log::info!("Model files already cached at {}", dir.display());
        return Ok(());
    }

    log::info!("Downloading {}@{} to {}", model_id, revision, dir.display());
    fs::create_dir_all(dir).with_context(|| format!("failed to create model dir {}", dir.display()))?;

    let base = format!("{}/{}/resolve/{}", config::model::HUB_BASE_URL, model_id, revision);

    let layout = match fetch_optional(&base, config::model::MODULES_FILE, dir)? {
        true => ModuleLayout::read(dir)?,
        false => {
            log::warn!("{} has no {}, assuming default layout", model_id, config::model::MODULES_FILE);
            ModuleLayout::default()
        }
    };

    let encoder_rel = |file: &str| join_rel(&layout.transformer_dir, file);

    fetch_required(&base, &encoder_rel(config::model::CONFIG_FILE), dir)?;
    fetch_required(&base, &encoder_rel(config::model::TOKENIZER_FILE), dir)?;
    fetch_required(&base, &join_rel(&layout.pooling_dir, config::model::CONFIG_FILE), dir)?;
    fetch_optional(&base, &encoder_rel(config::model::SENTENCE_BERT_CONFIG_FILE), dir)?;

    if !fetch_optional(&base, &encoder_rel(config::model::SAFETENSORS_FILE), dir)? {
        log::info!("No safetensors weights published, falling back to {}", config::model::PYTORCH_FILE);
        fetch_required(&base, &encoder_rel(config::model::PYTORCH_FILE), dir)?;
    }

    log::info!("Model download complete");
    Ok(())
}

fn join_rel(sub: &str, file: &str) -> String {
    if sub.is_empty() {
        file.to_string()
    } else {
        format!("{}/{}", sub.trim_end_matches('/'), file)
    }
}

fn fetch_required(base: &str, rel: &str, dir: &Path) -> anyhow::Result<()> {
    if !fetch_optional(base, rel, dir)? {
        bail!("{rel} not found at {base}");
    }
    Ok(())
}

/// Download `rel` into `dir`. Returns false when the hub answers 404.
fn fetch_optional(base: &str, rel: &str, dir: &Path) -> anyhow::Result<bool> {
    let dest = dir.join(rel);
    if dest.exists() {
        return Ok(true);
    }

    let url = format!("{base}/{rel}");
    log::info!("Downloading {} from {}", rel, url);

    let resp = match ureq::get(&url)
        .timeout(std::time::Duration::from_secs(config::model::DOWNLOAD_TIMEOUT_SECS))
        .call()
    {
        Ok(resp) => resp,
        Err(ureq::Error::Status(404, _)) => {
            log::info!("{} not present in repository", rel);
            return Ok(false);
        }
        Err(ureq::Error::Status(status, _)) => bail!("HTTP {status} downloading {url}"),
        Err(e) => return Err(e).with_context(|| format!("failed to download {url}")),
    };

    let mut body = Vec::new();
    resp.into_reader()
        .read_to_end(&mut body)
        .with_context(|| format!("failed to read response body for {url}"))?;
    if body.is_empty() {
        bail!("empty response downloading {url}");
    }

    write_atomic(&dest, &body)?;
    Ok(true)
}

/// Write `body` to `dest` via a sibling .tmp file and log its SHA256.
fn write_atomic(dest: &Path, body: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hex::encode(hasher.finalize());

    let tmp_path = dest.with_extension("tmp");
    let mut file =
        fs::File::create(&tmp_path).with_context(|| format!("failed to create {}", tmp_path.display()))?;
    file.write_all(body)?;
    file.flush()?;
    drop(file);

    fs::rename(&tmp_path, dest)
        .with_context(|| format!("failed to rename {} -> {}", tmp_path.display(), dest.display()))?;

    log::info!(
        "Saved {} ({} bytes, sha256 {})",
        dest.display(),
        body.len(),
        &hash[..12]
    );
    Ok(())
}

/// Get the user's home directory.
fn dirs_home() -> anyhow::Result<PathBuf> {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .context("cannot determine home directory (neither HOME nor USERPROFILE is set)")
}
