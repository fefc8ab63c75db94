mod manager;

pub use manager::{ConnectionManager, ConnectionState, NodeTable, Session, SessionInfo};
