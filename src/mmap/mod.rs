pub mod mmap_file;
pub mod record_view;
