pub mod facade;
pub mod inode;
pub mod logging;

pub use facade::FsFacade;
pub use inode::InodeTable;
