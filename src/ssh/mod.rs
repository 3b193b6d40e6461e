pub mod agent;
pub mod backend;
pub mod cipher;
pub mod context;
pub mod event;
pub mod handler;
pub mod interface;
pub mod keys;
pub mod registry;
pub mod session;
pub mod sftp;
pub mod transport;

pub use session::{Session, SessionState};
