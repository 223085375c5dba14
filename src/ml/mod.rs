pub mod backend;
pub mod data_source;
pub mod dataset;
pub mod inference;
pub mod layer_spec;
pub mod network;
pub mod training;

pub use backend::{default_device, InferenceBackend, TrainingBackend};
pub use data_source::{DataSource, InMemoryDataSource, Sample};
pub use dataset::{load_grayscale, FolderDataset};
pub use inference::{Classifier, ScoreVector};
pub use layer_spec::{Emotion, ImageDims, InputShape, LayerDescriptor, LayerSpec};
pub use network::{build, images_to_tensor, EmotionNet, NetworkOutput, NetworkPlan};
pub use training::{
    evaluate, train_model, Evaluation, ExponentialDecay, Hyperparameters, MonitoredMetric,
    Trainer, TrainingOutcome, TrainingProgress, TrainingResult,
};
