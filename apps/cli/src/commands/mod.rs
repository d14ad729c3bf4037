//! 命令模块

pub mod listen;
pub mod master;

pub use listen::ListenCommand;
pub use master::MasterCommand;
