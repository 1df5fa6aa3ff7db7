use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use squaresight::config::{AugmentConfig, ExperimentConfig, SplitConfig, StoreConfig};
use squaresight::data::{Dataset, DatasetBuilder, ImageStore, LabelAugmenter};
use squaresight::experiment::ExperimentRunner;
use squaresight::model::MlpBuilder;
use squaresight::synth::{generate_batch, SyntheticKind};
use squaresight::Termination;

fn build_artifact(raw_dir: &Path, output: &Path, resolution: u32, seed: u64, split: SplitConfig) {
    let store = ImageStore::new(
        raw_dir,
        StoreConfig {
            width: resolution,
            height: resolution,
            ..StoreConfig::default()
        },
    );
    let (images, stats) = store.decode_all().unwrap();
    assert_eq!(stats.skipped, 0);

    let augmenter = LabelAugmenter::new(AugmentConfig::default());
    let examples = augmenter.augment_all(images, seed);
    let dataset = DatasetBuilder::new(split, seed)
        .unwrap()
        .with_source_dirs(vec![raw_dir.to_string_lossy().into_owned()])
        .build(examples)
        .unwrap();
    dataset.save(output).unwrap();
}

#[test]
fn hundred_images_split_80_10_10_and_rebuild_identically() {
    let dir = TempDir::new().unwrap();
    let raw_dir = dir.path().join("raw");
    generate_batch(SyntheticKind::Solid, 100, &raw_dir, 64, 7).unwrap();

    let first = dir.path().join("dataset_a");
    let second = dir.path().join("dataset_b");
    build_artifact(&raw_dir, &first, 64, 42, SplitConfig::default());
    build_artifact(&raw_dir, &second, 64, 42, SplitConfig::default());

    let dataset = Dataset::load(&first).unwrap();
    assert_eq!(dataset.train.len(), 80);
    assert_eq!(dataset.validation.len(), 10);
    assert_eq!(dataset.test.len(), 10);

    // Same seed, same inputs: the artifact bytes must match exactly.
    for file in [
        "metadata.json",
        "train_images.f32",
        "train_labels.u8",
        "validation_labels.u8",
        "test_labels.u8",
    ] {
        let a = fs::read(first.join(file)).unwrap();
        let b = fs::read(second.join(file)).unwrap();
        assert_eq!(a, b, "{file} differs between identical builds");
    }

    // A different seed must reorder the shuffle.
    let third = dir.path().join("dataset_c");
    build_artifact(&raw_dir, &third, 64, 43, SplitConfig::default());
    let b = Dataset::load(&third).unwrap();
    assert_ne!(dataset.train.sources, b.train.sources);
}

#[test]
fn no_source_leaks_across_partitions_end_to_end() {
    let dir = TempDir::new().unwrap();
    let raw_dir = dir.path().join("raw");
    generate_batch(SyntheticKind::Solid, 50, &raw_dir, 32, 3).unwrap();

    let output = dir.path().join("dataset");
    build_artifact(&raw_dir, &output, 32, 11, SplitConfig::default());

    let dataset = Dataset::load(&output).unwrap();
    let mut seen = std::collections::HashSet::new();
    for partition in [&dataset.train, &dataset.validation, &dataset.test] {
        for source in &partition.sources {
            assert!(seen.insert(source.clone()), "{source} appears twice");
        }
    }
    assert_eq!(seen.len(), 50);
}

#[test]
fn separable_marker_data_trains_to_high_accuracy() {
    let dir = TempDir::new().unwrap();
    let raw_dir = dir.path().join("raw");
    // All-black backgrounds make marker detection perfectly separable.
    generate_batch(SyntheticKind::Black, 60, &raw_dir, 16, 0).unwrap();

    let dataset_path = dir.path().join("dataset");
    let split = SplitConfig {
        train: 0.7,
        validation: 0.15,
        test: 0.15,
    };
    let store = ImageStore::new(
        &raw_dir,
        StoreConfig {
            width: 16,
            height: 16,
            ..StoreConfig::default()
        },
    );
    let (images, _) = store.decode_all().unwrap();
    let augmenter = LabelAugmenter::new(AugmentConfig {
        min_side: 6,
        max_side: 6,
        ..AugmentConfig::default()
    });
    let examples = augmenter.augment_all(images, 5);
    let dataset = DatasetBuilder::new(split, 5).unwrap().build(examples).unwrap();
    dataset.save(&dataset_path).unwrap();

    let mut config = ExperimentConfig::default();
    config.model.hidden = vec![16];
    config.model.learning_rate = 1e-2;
    config.training.batch_size = 16;
    config.training.max_epochs = 40;
    config.training.patience = 40;

    let builder = MlpBuilder::new(config.model.clone());
    let out_dir = dir.path().join("out");
    let runner = ExperimentRunner::new(&dataset_path, &out_dir, config);
    let (summary, report) = runner.run(&builder).unwrap();

    assert_ne!(summary.termination, Termination::Failed);
    let best_accuracy = summary
        .history
        .iter()
        .map(|r| r.val_accuracy)
        .fold(0.0f32, f32::max);
    assert!(
        best_accuracy >= 0.95,
        "validation accuracy {best_accuracy} never reached 0.95"
    );
    assert!(report.epochs_completed > 0);
    assert!(out_dir.join("experiment.json").exists());
}

#[test]
fn augmented_copies_are_written_with_the_marker_burned_in() {
    let dir = TempDir::new().unwrap();
    let raw_dir = dir.path().join("raw");
    generate_batch(SyntheticKind::Black, 5, &raw_dir, 16, 0).unwrap();

    let store = ImageStore::new(&raw_dir, StoreConfig {
        width: 16,
        height: 16,
        ..StoreConfig::default()
    });
    let (images, _) = store.decode_all().unwrap();
    let augmenter = LabelAugmenter::new(AugmentConfig::default());
    let examples = augmenter.augment_all(images, 1);

    let augmented_dir = dir.path().join("augmented");
    let written = squaresight::data::write_augmented_copies(&examples, &augmented_dir).unwrap();
    assert_eq!(written.len(), 5);

    // Overlaid copies decode back with the marker burned in.
    let marked: Vec<&PathBuf> = examples
        .iter()
        .zip(&written)
        .filter(|(e, _)| e.label == 1)
        .map(|(_, p)| p)
        .collect();
    for path in marked {
        let img = image::open(path).unwrap().to_rgb8();
        assert!(img.pixels().any(|p| p.0 == [255, 255, 255]));
    }
}
