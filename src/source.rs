// THEORY:
// The `source` module is the thin edge between the filesystem and the
// analyser. Its job is to make sure that the orchestrator only ever sees
// descriptors of real images, and that pixels are loaded lazily, inside the
// worker that needs them.
//
// 1.  **Discovery** lists one directory, keeps regular files with an image
//     extension and drops hidden and operating-system files (`.DS_Store`,
//     `Thumbs.db`, `desktop.ini`). Capture timestamps come from modification
//     times, relative to the oldest image in the directory.
// 2.  **Loading** goes through the `ImageLoader` trait so the orchestrator can
//     be driven from disk (`FileImageLoader`) or from buffers already in
//     memory (`MemoryImageLoader`).

use crate::core_modules::frame::{Image, ImageDescriptor};
use crate::core_modules::utils::image_helper::image_helper;
use crate::error::ColonyResult;
use image::RgbaImage;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// File extensions decoded as images, matched case-insensitively.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff", "bmp"];

/// Files some operating systems drop into every folder.
const SYSTEM_FILES: &[&str] = &["thumbs.db", "desktop.ini", ".ds_store"];

/// Produces the pixels of an image on demand.
///
/// Called from blocking worker threads, once per image.
pub trait ImageLoader: Send + Sync {
    fn load(&self, descriptor: &ImageDescriptor) -> ColonyResult<Image>;
}

/// Decodes images from disk with the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileImageLoader;

impl ImageLoader for FileImageLoader {
    fn load(&self, descriptor: &ImageDescriptor) -> ColonyResult<Image> {
        let pixels = image_helper::load_rgba(&descriptor.path)?;
        Ok(Image::new(descriptor.clone(), pixels))
    }
}

/// Serves already-decoded buffers keyed by path.
#[derive(Debug, Default, Clone)]
pub struct MemoryImageLoader {
    images: HashMap<PathBuf, RgbaImage>,
}

impl MemoryImageLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, pixels: RgbaImage) {
        self.images.insert(path.into(), pixels);
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

impl ImageLoader for MemoryImageLoader {
    fn load(&self, descriptor: &ImageDescriptor) -> ColonyResult<Image> {
        let pixels = self.images.get(&descriptor.path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no image buffer registered for {}", descriptor.path.display()),
            )
        })?;
        Ok(Image::new(descriptor.clone(), pixels))
    }
}

/// True for names the analyser must never try to decode.
pub fn is_ignored_file_name(name: &str) -> bool {
    name.starts_with('.') || SYSTEM_FILES.contains(&name.to_lowercase().as_str())
}

pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// Lists the images of one directory as descriptors of `group_id`, sorted by
/// timestamp and then by path.
pub fn discover_images(dir: &Path, group_id: &str) -> ColonyResult<Vec<ImageDescriptor>> {
    let mut found: Vec<(PathBuf, SystemTime)> = Vec::new();
    let mut ignored = 0usize;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let metadata = entry.metadata()?;
        if !metadata.is_file() || is_ignored_file_name(&name) || !has_image_extension(&path) {
            debug!(path = %path.display(), "skipping non-image entry");
            ignored += 1;
            continue;
        }
        found.push((path, metadata.modified()?));
    }

    let Some(start) = found.iter().map(|(_, modified)| *modified).min() else {
        info!(dir = %dir.display(), ignored, "no images found");
        return Ok(Vec::new());
    };

    let mut descriptors: Vec<ImageDescriptor> = found
        .into_iter()
        .map(|(path, modified)| {
            let timestamp = modified.duration_since(start).unwrap_or(Duration::ZERO);
            ImageDescriptor::new(path, timestamp, group_id)
        })
        .collect();
    descriptors.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.path.cmp(&b.path)));

    info!(dir = %dir.display(), images = descriptors.len(), ignored, "discovered images");
    Ok(descriptors)
}
