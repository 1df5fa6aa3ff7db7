use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn::module::Module;
use burn::nn;
use burn::nn::loss::CrossEntropyLoss;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::activation::relu;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Int, Tensor, TensorData};
use burn_ndarray::NdArray;
use std::path::Path;

use super::{Model, ModelBuilder};
use crate::config::ModelConfig;
use crate::data::{ImageShape, Minibatch};

pub type DefaultBackend = Autodiff<NdArray<f32>>;

/// Fully-connected classifier over flattened pixels: one Linear layer per
/// configured hidden width, ReLU between layers, two output logits.
#[derive(Debug, Module)]
pub struct MlpNet<B: burn::tensor::backend::Backend> {
    layers: Vec<nn::Linear<B>>,
}

impl<B: burn::tensor::backend::Backend> MlpNet<B> {
    pub fn new(input_dim: usize, hidden: &[usize], device: &B::Device) -> Self {
        let mut widths = Vec::with_capacity(hidden.len() + 2);
        widths.push(input_dim);
        widths.extend_from_slice(hidden);
        widths.push(2);

        let layers = widths
            .windows(2)
            .map(|pair| nn::LinearConfig::new(pair[0], pair[1]).init(device))
            .collect();
        Self { layers }
    }

    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let (last, rest) = self.layers.split_last().expect("at least one layer");
        let mut x = input;
        for layer in rest {
            x = relu(layer.forward(x));
        }
        last.forward(x)
    }
}

/// The burn-backed model capability: MlpNet plus Adam and cross-entropy.
pub struct MlpClassifier<B: AutodiffBackend> {
    model: MlpNet<B>,
    optimizer: OptimizerAdaptor<Adam, MlpNet<B>, B>,
    loss_fn: CrossEntropyLoss<B>,
    learning_rate: f64,
    input_dim: usize,
    device: B::Device,
}

impl<B: AutodiffBackend> MlpClassifier<B> {
    pub fn new(config: ModelConfig, shape: ImageShape, device: &B::Device) -> Self {
        config.validate();
        let input_dim = shape.len();
        let model = MlpNet::new(input_dim, &config.hidden, device);
        let optimizer = AdamConfig::new().init::<B, MlpNet<B>>();
        let loss_fn = CrossEntropyLoss::new(None, device);

        Self {
            model,
            optimizer,
            loss_fn,
            learning_rate: config.learning_rate,
            input_dim,
            device: device.clone(),
        }
    }

    fn batch_tensors(&self, batch: &Minibatch) -> (Tensor<B, 2>, Tensor<B, 1, Int>) {
        let n = batch.len();
        let images = Tensor::<B, 2>::from_data(
            TensorData::new(batch.images.clone(), [n, self.input_dim]),
            &self.device,
        );
        let targets = Tensor::<B, 1, Int>::from_ints(batch.labels.as_slice(), &self.device);
        (images, targets)
    }
}

fn scalar<B: AutodiffBackend>(loss: Tensor<B, 1>) -> f32 {
    loss.detach()
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default()
        .first()
        .copied()
        .unwrap_or(f32::NAN)
}

impl<B: AutodiffBackend> Model for MlpClassifier<B> {
    fn step(&mut self, batch: &Minibatch) -> Result<f32> {
        let (images, targets) = self.batch_tensors(batch);
        let logits = self.model.forward(images);
        let loss = self.loss_fn.forward(logits, targets);
        let loss_value = scalar(loss.clone());

        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        self.model = self
            .optimizer
            .step(self.learning_rate, self.model.clone(), grads);
        Ok(loss_value)
    }

    fn evaluate(&mut self, batch: &Minibatch) -> Result<(f32, f32)> {
        let (images, targets) = self.batch_tensors(batch);
        let logits = self.model.forward(images);
        let loss_value = scalar(self.loss_fn.forward(logits.clone(), targets));

        // Argmax over the two logits, on the host.
        let scores = logits
            .detach()
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default();
        let correct = scores
            .chunks_exact(2)
            .zip(&batch.labels)
            .filter(|(row, label)| i64::from(row[1] > row[0]) == **label)
            .count();
        let accuracy = correct as f32 / batch.len() as f32;
        Ok((loss_value, accuracy))
    }

    fn save_weights(&self, path: &Path) -> Result<()> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.model
            .clone()
            .save_file(path.to_path_buf(), &recorder)
            .with_context(|| format!("Failed to save model weights to {:?}", path))?;
        Ok(())
    }

    fn load_weights(&mut self, path: &Path) -> Result<()> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.model = self
            .model
            .clone()
            .load_file(path.to_path_buf(), &recorder, &self.device)
            .with_context(|| format!("Failed to load model weights from {:?}", path))?;
        Ok(())
    }
}

/// Builds `MlpClassifier` instances on the default CPU backend.
pub struct MlpBuilder {
    config: ModelConfig,
}

impl MlpBuilder {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }
}

impl ModelBuilder for MlpBuilder {
    fn build(&self, shape: ImageShape) -> Result<Box<dyn Model>> {
        let device = Default::default();
        Ok(Box::new(MlpClassifier::<DefaultBackend>::new(
            self.config.clone(),
            shape,
            &device,
        )))
    }
}
