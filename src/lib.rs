//! PostgreSQL adapter: compiles record criteria into parameterized SQL,
//! runs it over pooled connections and casts the rows back into records.

pub mod adapter;
pub mod callback;
pub mod codec;
pub mod config;
pub mod criteria;
pub mod db;
pub mod error;
pub mod schema;
pub mod spatial;
pub mod types;

pub use adapter::Adapter;
pub use callback::spawn_with_callback;
pub use codec::Record;
pub use config::{AdapterConfig, ConnectionOptions, PoolOptions, SslMode};
pub use criteria::{
    Aggregate, AggregateFn, CompiledQuery, Criteria, DialectOptions, Filter, JoinSpec, Operator,
    SortSpec,
};
pub use db::{QueryOutput, TableDescription, TransactionHandle};
pub use error::{AdapterError, Result};
pub use schema::{AttributeSpec, CollectionInput};
