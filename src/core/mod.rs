pub mod result;
pub mod spec;
pub mod status;
pub mod utils;
