//! unistore: one key-value and list contract over several storage engines.
//!
//! - [`store`] - the [`Store`] handle, the backend contract, and every backend
//! - [`registry`] - named stores built from [`Descriptor`]s
//! - [`process`] - `stores.<name>.<Method>` handlers over JSON
//! - [`bridge`] - the `Store` class for JavaScript
//! - [`commands`] - the `unistore` CLI

pub mod bridge;
pub mod commands;
pub mod config;
pub mod error;
pub mod process;
pub mod registry;
pub mod sql;
pub mod store;
pub mod value;

pub use config::{Descriptor, StoreType};
pub use error::{Error, Result};
pub use registry::{Connector, Registry};
pub use store::Store;
pub use value::{Body, Kind, Value};
