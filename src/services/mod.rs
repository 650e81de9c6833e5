//! Long-running services: the database pool + schema model, the dynamic GraphQL schema, and
//! the HTTP/WebSocket server, wired together by [manager::ServicesManager].

pub mod auth;
pub mod database;
pub mod graphql;
pub mod http_server;
pub mod manager;

pub use database::{DatabaseService, DatabaseServiceConfig};
pub use graphql::GraphqlService;
pub use http_server::{HttpServerConfig, HttpServerService};
pub use manager::{Service, ServiceHealth, ServicesManager};
