pub mod clock;
pub mod compactor;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod external;
pub mod limits;
pub mod model;
pub mod observability;
pub mod payment;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
