use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{Image, ImageShape};
use crate::config::StoreConfig;
use crate::error::{DatasetError, DatasetResult};

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "bmp", "png"];

/// A decoded image together with the path it came from.
#[derive(Debug, Clone)]
pub struct StoredImage {
    pub path: PathBuf,
    pub image: Image,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeStats {
    pub decoded: usize,
    pub skipped: usize,
    pub cache_hits: usize,
}

/// Reads a directory tree of images and decodes them to a fixed resolution.
///
/// Files are enumerated in lexical path order, so the downstream shuffle
/// sees the same sequence on every platform. Decoding runs in parallel but
/// results keep the enumeration order. Unreadable files are skipped with a
/// warning, never fatal.
pub struct ImageStore {
    root: PathBuf,
    config: StoreConfig,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>, config: StoreConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    pub fn shape(&self) -> ImageShape {
        ImageShape::new(3, self.config.height as usize, self.config.width as usize)
    }

    /// Enumerate image files under the root, sorted by full path.
    pub fn list_files(&self) -> DatasetResult<Vec<PathBuf>> {
        if !self.root.exists() {
            return Err(DatasetError::io(
                &self.root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "source directory not found"),
            ));
        }
        let mut files: Vec<PathBuf> = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| {
                        let ext = ext.to_ascii_lowercase();
                        IMAGE_EXTENSIONS.iter().any(|known| *known == ext)
                    })
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Decode every enumerated file, in enumeration order.
    pub fn decode_all(&self) -> DatasetResult<(Vec<StoredImage>, DecodeStats)> {
        let files = self.list_files()?;
        info!("Decoding {} images from {:?}", files.len(), self.root);

        if let Some(cache_dir) = &self.config.cache_dir {
            fs::create_dir_all(cache_dir).map_err(|e| DatasetError::io(cache_dir, e))?;
        }

        let results: Vec<Option<(StoredImage, bool)>> = files
            .par_iter()
            .map(|path| match self.decode_one(path) {
                Ok((image, cache_hit)) => Some((
                    StoredImage {
                        path: path.clone(),
                        image,
                    },
                    cache_hit,
                )),
                Err(e) => {
                    warn!("Skipping unreadable image {:?}: {}", path, e);
                    None
                }
            })
            .collect();

        let mut stats = DecodeStats::default();
        let mut images = Vec::with_capacity(results.len());
        for entry in results {
            match entry {
                Some((stored, cache_hit)) => {
                    stats.decoded += 1;
                    if cache_hit {
                        stats.cache_hits += 1;
                    }
                    images.push(stored);
                }
                None => stats.skipped += 1,
            }
        }

        info!(
            "Decoded {} images ({} skipped, {} cache hits)",
            stats.decoded, stats.skipped, stats.cache_hits
        );
        Ok((images, stats))
    }

    fn decode_one(&self, path: &Path) -> DatasetResult<(Image, bool)> {
        let shape = self.shape();
        if let Some(cached) = self.read_cache(path, shape) {
            return Ok((cached, true));
        }

        let decoded = image::open(path).map_err(|e| DatasetError::Decode {
            path: path.to_path_buf(),
            source: e,
        })?;
        let resized = image::imageops::resize(
            &decoded.to_rgb8(),
            self.config.width,
            self.config.height,
            self.config.filter.to_image_filter(),
        );

        // CHW layout, normalized to [0,1].
        let mut pixels = Vec::with_capacity(shape.len());
        for c in 0..3u32 {
            for y in 0..self.config.height {
                for x in 0..self.config.width {
                    let p = resized.get_pixel(x, y);
                    pixels.push(f32::from(p[c as usize]) / 255.0);
                }
            }
        }
        let image = Image::new(pixels, shape);
        self.write_cache(path, &image);
        Ok((image, false))
    }

    fn cache_path(&self, source: &Path) -> Option<PathBuf> {
        let cache_dir = self.config.cache_dir.as_ref()?;
        let rel = source.strip_prefix(&self.root).unwrap_or(source);
        let mut key = rel.to_string_lossy().replace(['/', '\\'], "_");
        key.push_str(&format!("_{}x{}.f32", self.config.width, self.config.height));
        Some(cache_dir.join(key))
    }

    fn read_cache(&self, source: &Path, shape: ImageShape) -> Option<Image> {
        let cache_path = self.cache_path(source)?;
        let bytes = fs::read(&cache_path).ok()?;
        if bytes.len() != shape.len() * 4 {
            warn!("Discarding stale cache entry {:?}", cache_path);
            return None;
        }
        let pixels = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Some(Image::new(pixels, shape))
    }

    fn write_cache(&self, source: &Path, image: &Image) {
        let Some(cache_path) = self.cache_path(source) else {
            return;
        };
        let mut bytes = Vec::with_capacity(image.pixels.len() * 4);
        for v in &image.pixels {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        // Best effort: a missing cache entry only costs a re-decode.
        if let Err(e) = fs::write(&cache_path, bytes) {
            debug!("Failed to write decode cache {:?}: {}", cache_path, e);
        }
    }
}
