pub mod dap;
pub mod error;
pub mod remote;
pub mod session;
