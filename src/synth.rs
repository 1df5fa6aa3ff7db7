use clap::ValueEnum;
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{DatasetError, DatasetResult};

/// Background flavor for generated images, from simplest to least uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SyntheticKind {
    /// All-black backgrounds.
    Black,
    /// One random solid color per image.
    Solid,
}

/// Write `count` square background images into `out_dir`, in the same
/// on-disk layout the image store consumes. Colors for `solid` are drawn
/// from the seed, so a batch is reproducible.
pub fn generate_batch(
    kind: SyntheticKind,
    count: usize,
    out_dir: &Path,
    size: u32,
    seed: u64,
) -> DatasetResult<Vec<PathBuf>> {
    fs::create_dir_all(out_dir).map_err(|e| DatasetError::io(out_dir, e))?;
    let mut rng = StdRng::seed_from_u64(seed);

    let mut written = Vec::with_capacity(count);
    for i in 1..=count {
        let color = match kind {
            SyntheticKind::Black => Rgb([0u8, 0, 0]),
            SyntheticKind::Solid => Rgb([rng.gen(), rng.gen(), rng.gen()]),
        };
        let path = out_dir.join(format!("{i:05}.bmp"));
        RgbImage::from_pixel(size, size, color)
            .save(&path)
            .map_err(|e| DatasetError::Decode {
                path: path.clone(),
                source: e,
            })?;
        written.push(path);
    }
    info!("Generated {} {:?} images in {:?}", count, kind, out_dir);
    Ok(written)
}
