pub mod service;

pub use service::{GraphqlService, GraphqlServiceConfig};
