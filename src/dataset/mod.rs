pub mod loader;

pub use loader::{build_registry, image_names, load_patch_dir, load_patches, load_records, merge_patches, normalize_id};
