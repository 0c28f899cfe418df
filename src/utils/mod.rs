pub mod command;
pub mod file;
pub mod manifest;
pub mod notify;
pub mod streams;
pub mod system;
