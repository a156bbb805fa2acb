use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, anyhow};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;

/// An ONNX model the pipeline needs on disk before it starts.
#[derive(Clone, Debug)]
pub struct ModelFile {
    pub name: &'static str,
    pub path: PathBuf,
    /// Where to fetch the model when `path` does not exist yet.
    pub url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelEvent {
    AlreadyPresent,
    Started { total: Option<u64> },
    Progress { downloaded: u64, total: Option<u64> },
    Finished,
}

/// Makes sure the model file exists, downloading it when a URL is known.
pub fn ensure_model_ready<F>(model: &ModelFile, mut on_event: F) -> anyhow::Result<()>
where
    F: FnMut(ModelEvent),
{
    if model.path.exists() {
        on_event(ModelEvent::AlreadyPresent);
        return Ok(());
    }

    let url = model.url.as_deref().ok_or_else(|| {
        anyhow!(
            "{} model not found at {} and no download URL is configured",
            model.name,
            model.path.display()
        )
    })?;

    if let Some(parent) = model.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create model directory {}", parent.display()))?;
    }

    download_to_path(model.name, url, &model.path, &mut on_event)
        .with_context(|| format!("failed to download {} model", model.name))
}

/// `ensure_model_ready` with a terminal progress bar.
pub fn ensure_model_ready_with_progress(model: &ModelFile) -> anyhow::Result<()> {
    let mut progress: Option<ProgressBar> = None;
    ensure_model_ready(model, |event| match event {
        ModelEvent::Started { total } => progress = Some(create_progress_bar(total)),
        ModelEvent::Progress { downloaded, .. } => {
            if let Some(pb) = progress.as_ref() {
                pb.set_position(downloaded);
            }
        }
        ModelEvent::Finished => {
            if let Some(pb) = progress.take() {
                pb.finish_with_message(format!("{} model ready", model.name));
            }
        }
        ModelEvent::AlreadyPresent => {
            log::debug!("{} model found at {}", model.name, model.path.display())
        }
    })
}

fn download_to_path<F>(name: &str, url: &str, dest: &Path, on_event: &mut F) -> anyhow::Result<()>
where
    F: FnMut(ModelEvent),
{
    log::info!("downloading {name} model from {url} to {}", dest.display());

    let client = Client::new();
    let mut response = client
        .get(url)
        .send()
        .context("failed to start model download")?
        .error_for_status()
        .context("model download returned error status")?;

    let total = response.content_length();
    on_event(ModelEvent::Started { total });

    let tmp_path = dest.with_extension("download");
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut downloaded: u64 = 0;
    let mut buffer = [0u8; 16 * 1024];
    loop {
        let bytes_read = response
            .read(&mut buffer)
            .context("failed while reading model bytes")?;
        if bytes_read == 0 {
            break;
        }
        file.write_all(&buffer[..bytes_read])
            .context("failed while writing model to disk")?;
        downloaded += bytes_read as u64;
        on_event(ModelEvent::Progress { downloaded, total });
    }

    file.sync_all()
        .context("failed to flush downloaded model to disk")?;
    fs::rename(&tmp_path, dest).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            tmp_path.display(),
            dest.display()
        )
    })?;

    on_event(ModelEvent::Finished);
    Ok(())
}

fn create_progress_bar(total: Option<u64>) -> ProgressBar {
    match total {
        Some(total) if total > 0 => {
            let pb = ProgressBar::new(total);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            ) {
                pb.set_style(style.progress_chars("=>-"));
            }
            pb
        }
        _ => {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.green} downloading model") {
                pb.set_style(style);
            }
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        }
    }
}
