mod handler;
pub mod parser;

pub use handler::handle_client;
pub use parser::{ConnectRequest, RequestParser};
