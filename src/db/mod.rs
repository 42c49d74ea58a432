mod analyzer;
mod cache;
mod connection;
mod executor;
mod metrics;
mod pool;
mod request;
mod result;
mod schema;
mod transaction;
mod value;

pub use analyzer::*;
pub use cache::*;
pub use connection::*;
pub use executor::*;
pub use metrics::*;
pub use pool::*;
pub use request::*;
pub use result::*;
pub use schema::*;
pub use transaction::*;
pub use value::*;
