pub mod analysis;
pub mod food;
pub mod ingredient;
