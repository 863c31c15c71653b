//! Burn convolutional network shared by the trainer and the prediction tool.
//!
//! `ConvNet` stacks conv blocks (conv 3x3 same → leaky ReLU → 2x2 max pool → dropout),
//! then global average pooling, a hidden dense layer and a linear head. The head emits
//! logits; `scores` applies softmax for classifiers and is the identity for regressors.

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::tensor::activation::{leaky_relu, softmax};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use data_contracts::{ModelArch, ModelDescriptor};

const LEAKY_SLOPE: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct ConvNetConfig {
    pub in_channels: usize,
    pub filters: Vec<usize>,
    pub block_dropout: Vec<f64>,
    pub hidden: usize,
    pub hidden_dropout: f64,
    pub arch: ModelArch,
}

impl Default for ConvNetConfig {
    fn default() -> Self {
        Self::from(&ModelDescriptor::default())
    }
}

impl From<&ModelDescriptor> for ConvNetConfig {
    fn from(desc: &ModelDescriptor) -> Self {
        Self {
            in_channels: desc.input.channels as usize,
            filters: desc.conv_filters.clone(),
            block_dropout: desc.conv_dropout.clone(),
            hidden: desc.hidden,
            hidden_dropout: desc.hidden_dropout,
            arch: desc.arch,
        }
    }
}

#[derive(Debug, Module)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    pool: MaxPool2d,
    dropout: Dropout,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, dropout: f64, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);
        let pool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();
        let dropout = DropoutConfig::new(dropout).init();
        Self {
            conv,
            pool,
            dropout,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = leaky_relu(self.conv.forward(input), LEAKY_SLOPE);
        self.dropout.forward(self.pool.forward(x))
    }
}

#[derive(Debug, Module)]
pub struct ConvNet<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    gap: AdaptiveAvgPool2d,
    hidden: Linear<B>,
    hidden_dropout: Dropout,
    head: Linear<B>,
    classifier: bool,
}

impl<B: Backend> ConvNet<B> {
    pub fn new(cfg: &ConvNetConfig, device: &B::Device) -> Self {
        let mut blocks = Vec::with_capacity(cfg.filters.len());
        let mut channels = cfg.in_channels.max(1);
        for (i, &filters) in cfg.filters.iter().enumerate() {
            let p = cfg.block_dropout.get(i).copied().unwrap_or(0.0);
            blocks.push(ConvBlock::new(channels, filters, p, device));
            channels = filters;
        }
        Self {
            blocks,
            gap: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            hidden: LinearConfig::new(channels, cfg.hidden).init(device),
            hidden_dropout: DropoutConfig::new(cfg.hidden_dropout).init(),
            head: LinearConfig::new(cfg.hidden, cfg.arch.output_len().max(1)).init(device),
            classifier: cfg.arch.is_classifier(),
        }
    }

    /// `[B, C, H, W]` images to `[B, outputs]` logits.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = input;
        for block in &self.blocks {
            x = block.forward(x);
        }
        let [batch, channels, _, _] = x.dims();
        let x = self.gap.forward(x).reshape([batch, channels]);
        let x = leaky_relu(self.hidden.forward(x), LEAKY_SLOPE);
        self.head.forward(self.hidden_dropout.forward(x))
    }

    /// Class probabilities for classifiers, raw outputs for regressors.
    pub fn scores(&self, logits: Tensor<B, 2>) -> Tensor<B, 2> {
        if self.classifier {
            softmax(logits, 1)
        } else {
            logits
        }
    }

    pub fn is_classifier(&self) -> bool {
        self.classifier
    }
}

pub mod prelude {
    pub use super::{ConvBlock, ConvNet, ConvNetConfig};
}
