pub mod batch;
pub mod layout;
pub mod metadata_store;
