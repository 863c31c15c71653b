//! [`Trainable`] backed by the Burn `ConvNet`.

use crate::error::{TrainError, TrainResult};
use crate::trainable::{count_correct, BatchMetrics, Restore, Trainable};
use burn::module::{AutodiffModule, Module};
use burn::nn::loss::{MseLoss, Reduction};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::activation::log_softmax;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use data_contracts::ModelDescriptor;
use image_dataset::Batch;
use models::{ConvNet, ConvNetConfig};
use std::fs;
use std::path::Path;

/// Weights file stem; the recorder appends `.bin`.
pub const MODEL_FILE_STEM: &str = "model";
pub const DESCRIPTOR_FILE: &str = "model.json";

pub struct BurnModel<B: AutodiffBackend> {
    net: ConvNet<B>,
    optim: OptimizerAdaptor<Adam, ConvNet<B>, B>,
    descriptor: ModelDescriptor,
    learning_rate: f64,
    steps: usize,
    device: B::Device,
}

impl<B: AutodiffBackend> BurnModel<B> {
    pub fn new(descriptor: ModelDescriptor, learning_rate: f64, device: B::Device) -> TrainResult<Self> {
        descriptor
            .validate()
            .map_err(|e| TrainError::Config(e.to_string()))?;
        let net = ConvNet::new(&ConvNetConfig::from(&descriptor), &device);
        Ok(Self::with_net(net, descriptor, learning_rate, device))
    }

    fn with_net(net: ConvNet<B>, descriptor: ModelDescriptor, learning_rate: f64, device: B::Device) -> Self {
        Self {
            net,
            optim: AdamConfig::new().init::<B, ConvNet<B>>(),
            descriptor,
            learning_rate,
            steps: 0,
            device,
        }
    }

    pub fn net(&self) -> &ConvNet<B> {
        &self.net
    }

    pub fn load(dir: &Path, learning_rate: f64, device: B::Device) -> TrainResult<Self> {
        let load_err = |msg: String| TrainError::CheckpointLoad {
            path: dir.to_path_buf(),
            msg,
        };
        let raw = fs::read(dir.join(DESCRIPTOR_FILE))
            .map_err(|e| load_err(format!("{DESCRIPTOR_FILE}: {e}")))?;
        let descriptor: ModelDescriptor =
            serde_json::from_slice(&raw).map_err(|e| load_err(format!("{DESCRIPTOR_FILE}: {e}")))?;
        descriptor
            .validate()
            .map_err(|e| load_err(e.to_string()))?;
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        let net = ConvNet::<B>::new(&ConvNetConfig::from(&descriptor), &device)
            .load_file(dir.join(MODEL_FILE_STEM), &recorder, &device)
            .map_err(|e| load_err(e.to_string()))?;
        Ok(Self::with_net(net, descriptor, learning_rate, device))
    }
}

fn batch_tensors<Bk: Backend>(batch: &Batch, device: &Bk::Device) -> (Tensor<Bk, 4>, Tensor<Bk, 2>) {
    let n = batch.len();
    let s = batch.shape;
    let inputs = Tensor::from_data(
        TensorData::new(
            batch.inputs.clone(),
            [n, s.channels as usize, s.height as usize, s.width as usize],
        ),
        device,
    );
    let targets = Tensor::from_data(TensorData::new(batch.labels.clone(), [n, batch.label_len]), device);
    (inputs, targets)
}

fn loss_fn<Bk: Backend>(classifier: bool, logits: Tensor<Bk, 2>, targets: Tensor<Bk, 2>) -> Tensor<Bk, 1> {
    if classifier {
        // categorical cross-entropy against one-hot targets
        (targets * log_softmax(logits, 1)).sum_dim(1).mean().neg()
    } else {
        MseLoss::new().forward(logits, targets, Reduction::Mean)
    }
}

fn to_vec<Bk: Backend, const D: usize>(t: Tensor<Bk, D>) -> TrainResult<Vec<f32>> {
    data_to_vec(t.into_data())
}

fn data_to_vec(data: TensorData) -> TrainResult<Vec<f32>> {
    data.to_vec::<f32>()
        .map_err(|e| TrainError::Model(format!("reading tensor data: {e:?}")))
}

impl<B: AutodiffBackend> BurnModel<B> {
    fn metrics<Bk: Backend>(
        &self,
        batch: &Batch,
        logits: Tensor<Bk, 2>,
        loss: Tensor<Bk, 1>,
    ) -> TrainResult<BatchMetrics> {
        let loss = to_vec(loss)?
            .first()
            .copied()
            .ok_or_else(|| TrainError::Model("loss tensor is empty".into()))?;
        let correct = if self.descriptor.arch.is_classifier() {
            let scores = to_vec(logits)?;
            Some(count_correct(&scores, &batch.labels, batch.label_len))
        } else {
            None
        };
        Ok(BatchMetrics {
            loss,
            correct,
            samples: batch.len(),
        })
    }

    fn check_batch(&self, batch: &Batch) -> TrainResult<()> {
        if batch.shape != self.descriptor.input || batch.label_len != self.descriptor.output_len() {
            return Err(TrainError::Model(format!(
                "batch shape {:?} x {} does not match model input {:?} x {}",
                batch.shape,
                batch.label_len,
                self.descriptor.input,
                self.descriptor.output_len()
            )));
        }
        Ok(())
    }
}

impl<B: AutodiffBackend> Trainable for BurnModel<B> {
    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn optimizer_steps(&self) -> usize {
        self.steps
    }

    fn train_step(&mut self, batch: &Batch) -> TrainResult<BatchMetrics> {
        self.check_batch(batch)?;
        let (inputs, targets) = batch_tensors::<B>(batch, &self.device);
        let logits = self.net.forward(inputs);
        let loss = loss_fn(self.descriptor.arch.is_classifier(), logits.clone(), targets);
        let metrics = self.metrics(batch, logits.detach(), loss.clone().detach())?;
        let grads = GradientsParams::from_grads(loss.backward(), &self.net);
        self.net = self.optim.step(self.learning_rate, self.net.clone(), grads);
        self.steps += 1;
        Ok(metrics)
    }

    fn evaluate(&self, batch: &Batch) -> TrainResult<BatchMetrics> {
        self.check_batch(batch)?;
        let net = self.net.valid();
        let (inputs, targets) = batch_tensors::<B::InnerBackend>(batch, &self.device);
        let logits = net.forward(inputs);
        let loss = loss_fn(self.descriptor.arch.is_classifier(), logits.clone(), targets);
        self.metrics(batch, logits, loss)
    }

    fn predict(&self, inputs: &[f32], count: usize) -> TrainResult<Vec<Vec<f32>>> {
        let s = self.descriptor.input;
        if inputs.len() != count * s.len() {
            return Err(TrainError::Model(format!(
                "{} input values for {count} images of {} values",
                inputs.len(),
                s.len()
            )));
        }
        if count == 0 {
            return Ok(Vec::new());
        }
        let net = self.net.valid();
        let x = Tensor::<B::InnerBackend, 4>::from_data(
            TensorData::new(
                inputs.to_vec(),
                [count, s.channels as usize, s.height as usize, s.width as usize],
            ),
            &self.device,
        );
        let scores = to_vec(net.scores(net.forward(x)))?;
        let width = self.descriptor.output_len();
        if scores.len() != count * width {
            return Err(TrainError::Model(format!(
                "model produced {} scores for {count} images of {width} outputs",
                scores.len()
            )));
        }
        Ok(scores.chunks(width.max(1)).map(<[f32]>::to_vec).collect())
    }

    fn save(&self, dir: &Path) -> TrainResult<()> {
        let write_err = |msg: String| TrainError::CheckpointWrite {
            path: dir.to_path_buf(),
            msg,
        };
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        self.net
            .clone()
            .save_file(dir.join(MODEL_FILE_STEM), &recorder)
            .map_err(|e| write_err(e.to_string()))?;
        let raw = serde_json::to_vec_pretty(&self.descriptor).map_err(|e| write_err(e.to_string()))?;
        fs::write(dir.join(DESCRIPTOR_FILE), raw).map_err(|e| write_err(format!("{DESCRIPTOR_FILE}: {e}")))
    }
}

impl<B: AutodiffBackend> Restore for BurnModel<B> {
    fn restore(dir: &Path, learning_rate: f64) -> TrainResult<Self> {
        Self::load(dir, learning_rate, B::Device::default())
    }
}
