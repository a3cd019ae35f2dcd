pub mod dev;
pub mod version;
