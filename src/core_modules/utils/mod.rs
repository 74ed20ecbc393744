pub mod image_helper;
pub mod lm_optimizer;
pub mod stats;
