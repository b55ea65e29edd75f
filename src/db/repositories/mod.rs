pub mod readings;
pub mod sessions;
