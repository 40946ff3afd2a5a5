mod connector;

pub use connector::{connect, connect_from_config, connect_with_retry};
