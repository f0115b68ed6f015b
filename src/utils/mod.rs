pub mod hash;
pub mod keyed_mutex;
pub mod validation;
