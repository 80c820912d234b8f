pub mod config;
pub mod labels;
pub mod model_metadata;
pub mod model_storage;

pub use config::{AppConfig, DeviceType, ModelSettings, TrainingSettings};
pub use labels::{LabelSet, MANGO_LABELS};
pub use model_metadata::{ModelMetadata, MODEL_FORMAT_VERSION};
pub use model_storage::{save_model_with_metadata, load_metadata, load_model_with_metadata, print_metadata_info};
