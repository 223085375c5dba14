pub mod checkpoint;
pub mod config;
pub mod model_metadata;
pub mod model_storage;

pub use checkpoint::{resolve_checkpoint, restore, CheckpointPolicy, CheckpointStore};
pub use config::{AppConfig, ModelSettings, TrainingSettings};
pub use model_metadata::{CheckpointMetadata, TensorHandles, CHECKPOINT_FORMAT_VERSION};
pub use model_storage::{
    load_checkpoint_archive, load_metadata, print_metadata_info, save_checkpoint_archive,
};
