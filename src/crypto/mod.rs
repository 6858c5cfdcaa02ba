pub mod keys;
pub mod merkle;
pub mod scheme;
