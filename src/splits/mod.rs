pub mod asplit;
pub mod extractor;
