pub mod bpe;
pub mod error;
pub mod special;
pub mod trainer;
pub mod vocab;

pub use bpe::BPE;
pub use error::TokenizerError;
pub use special::SpecialTokens;
pub use trainer::Trainer;
pub use vocab::Vocab;
