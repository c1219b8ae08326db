pub mod config;
pub mod harness;
pub mod lifecycle;
pub mod path_safety;
pub mod unique_id;
