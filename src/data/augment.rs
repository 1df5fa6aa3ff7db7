use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{Image, LabeledExample, StoredImage};
use crate::config::AugmentConfig;
use crate::error::{DatasetError, DatasetResult};

/// Decides, per image, whether to overlay the square marker, and records the
/// resulting binary label.
///
/// Augmentation is pure given the seed: the same (image, seed) pair always
/// produces bit-identical output. Callers derive one seed per image so a
/// whole dataset build is reproducible from a single base seed.
pub struct LabelAugmenter {
    config: AugmentConfig,
}

impl LabelAugmenter {
    pub fn new(config: AugmentConfig) -> Self {
        config.validate();
        Self { config }
    }

    /// Derive the seed for the image at `index` from a dataset-level seed.
    pub fn seed_for(base_seed: u64, index: usize) -> u64 {
        (index as u64)
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(base_seed)
    }

    pub fn augment(&self, image: Image, source: impl Into<String>, seed: u64) -> LabeledExample {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut image = image;

        let overlay = rng.gen_bool(self.config.probability);
        if overlay {
            self.overlay_square(&mut image, &mut rng);
        }

        LabeledExample {
            image,
            label: u8::from(overlay),
            source: source.into(),
        }
    }

    /// Augment a decoded sequence in order, one derived seed per image.
    pub fn augment_all(&self, images: Vec<StoredImage>, base_seed: u64) -> Vec<LabeledExample> {
        let examples: Vec<LabeledExample> = images
            .into_iter()
            .enumerate()
            .map(|(index, stored)| {
                let seed = Self::seed_for(base_seed, index);
                self.augment(stored.image, stored.path.to_string_lossy(), seed)
            })
            .collect();
        let positives = examples.iter().filter(|e| e.label == 1).count();
        info!(
            "Augmented {} images ({} with marker, {} without)",
            examples.len(),
            positives,
            examples.len() - positives
        );
        examples
    }

    fn overlay_square(&self, image: &mut Image, rng: &mut StdRng) {
        let shape = image.shape;
        let (width, height) = (shape.width as u32, shape.height as u32);

        // Clamp the side range to the largest square that fits.
        let max_side = self.config.max_side.min(width).min(height);
        let min_side = self.config.min_side.min(max_side);
        let side = rng.gen_range(min_side..=max_side);

        let x = rng.gen_range(0..=width - side) as usize;
        let y = rng.gen_range(0..=height - side) as usize;
        let side = side as usize;

        for c in 0..shape.channels {
            let plane = c * shape.height * shape.width;
            for row in y..y + side {
                let start = plane + row * shape.width + x;
                image.pixels[start..start + side].fill(self.config.marker_value);
            }
        }
    }
}

/// Write each example back out as a BMP named after its source stem, for
/// inspection of what the augmenter actually produced.
pub fn write_augmented_copies(examples: &[LabeledExample], dir: &Path) -> DatasetResult<Vec<PathBuf>> {
    fs::create_dir_all(dir).map_err(|e| DatasetError::io(dir, e))?;
    let mut written = Vec::with_capacity(examples.len());
    for (index, example) in examples.iter().enumerate() {
        let stem = Path::new(&example.source)
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{index:06}"));
        let path = dir.join(format!("{stem}.bmp"));

        let shape = example.image.shape;
        let mut out = image::RgbImage::new(shape.width as u32, shape.height as u32);
        for (x, y, pixel) in out.enumerate_pixels_mut() {
            let offset = y as usize * shape.width + x as usize;
            let plane = shape.height * shape.width;
            for c in 0..3 {
                let v = example.image.pixels[c * plane + offset];
                pixel[c] = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
            }
        }
        out.save(&path).map_err(|e| DatasetError::Decode {
            path: path.clone(),
            source: e,
        })?;
        written.push(path);
    }
    info!("Wrote {} augmented copies to {:?}", written.len(), dir);
    Ok(written)
}
