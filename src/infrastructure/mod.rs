pub mod fast_path;
