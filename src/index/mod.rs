pub mod scanner;
pub mod extractor;
pub mod offset_index;
pub mod group_index;
