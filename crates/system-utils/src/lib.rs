pub mod path;
pub mod process;
