pub mod adhoc;
pub mod server;

pub use adhoc::{ParseError, Request, Response, StatusFormat};
pub use server::ControlServer;
