pub mod command;
pub mod device;
pub mod event;
