pub mod file_lock;
pub mod index_file;
pub mod layout;
