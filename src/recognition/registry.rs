use std::path::{Path, PathBuf};

use opencv::core::Mat;
use opencv::imgcodecs;
use opencv::prelude::*;

use crate::alert::sanitize_label;

use super::engine::{EngineError, Encoding, FaceEngine};
use super::worker::to_engine_layout;

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// A labelled reference encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct KnownFace {
    pub label: String,
    pub encoding: Encoding,
}

/// Reference faces loaded once at startup, in load order.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    faces: Vec<KnownFace>,
}

impl Registry {
    pub fn new(faces: Vec<KnownFace>) -> Self {
        Self { faces }
    }

    /// Scan `<root>/<label>/*.{png,jpg,jpeg}` and encode the first face of
    /// every image. Images without a face, or that fail to load, are skipped.
    ///
    /// Directory names are reduced to the incident filename alphabet, so a
    /// label reads the same live and after a rescan of the snapshots.
    pub fn load(root: &Path, engine: &mut dyn FaceEngine) -> Self {
        tracing::info!(path = %root.display(), "loading known faces");

        let mut faces = Vec::new();
        for (label, dir) in label_dirs(root) {
            for image_path in image_files(&dir) {
                match encode_image(&image_path, engine) {
                    Ok(Some(encoding)) => {
                        tracing::info!(label = %label, image = %image_path.display(), "loaded face");
                        faces.push(KnownFace {
                            label: label.clone(),
                            encoding,
                        });
                    }
                    Ok(None) => {
                        tracing::warn!(image = %image_path.display(), "no face found in image");
                    }
                    Err(e) => {
                        tracing::error!(image = %image_path.display(), error = %e, "failed to load image");
                    }
                }
            }
        }

        tracing::info!(count = faces.len(), "known faces loaded");
        Self { faces }
    }

    pub fn faces(&self) -> &[KnownFace] {
        &self.faces
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

}

fn label_dirs(root: &Path) -> Vec<(String, PathBuf)> {
    let read_dir = match std::fs::read_dir(root) {
        Ok(rd) => rd,
        Err(e) => {
            tracing::error!(path = %root.display(), error = %e, "face database directory not readable");
            return Vec::new();
        }
    };

    let mut dirs: Vec<(String, PathBuf)> = read_dir
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?;
            let label = sanitize_label(name);
            if label != name {
                tracing::warn!(directory = %name, label = %label, "face directory renamed for labels");
            }
            Some((label, path))
        })
        .collect();
    dirs.sort();
    dirs
}

fn image_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = read_dir
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && has_image_extension(path))
        .collect();
    files.sort();
    files
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let lower = e.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}

fn encode_image(path: &Path, engine: &mut dyn FaceEngine) -> Result<Option<Encoding>, EngineError> {
    let image = imgcodecs::imread(&path.to_string_lossy(), imgcodecs::IMREAD_COLOR)?;
    if image.empty() {
        return Err(EngineError::Unreadable(path.display().to_string()));
    }
    let prepared: Mat = to_engine_layout(&image, engine.channel_order())?;
    engine.encode_first(&prepared)
}
