pub mod collator;
pub mod config;
pub mod data;
pub mod train;

pub use collator::{Batch, Collator};
pub use config::FineTuneConfig;
pub use data::{load_splits, prepare, TokenizedDataset};
pub use train::{lr_factor, Trainer, TrainerState};
