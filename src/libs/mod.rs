pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod request;
pub mod schema;
pub mod session;
pub mod statement;
pub mod value;

// Re-export them for easier access from main.rs
pub use catalog::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use request::*;
pub use schema::*;
pub use session::*;
pub use statement::*;
pub use value::*;
