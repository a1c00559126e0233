pub mod key_material;
pub mod persistence;
pub mod services;
