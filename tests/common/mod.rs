#![allow(dead_code)]

use lazy_static::lazy_static;
use std::sync::{Arc, Once};
use testcontainers::{clients::Cli, Container};
use testcontainers_modules::postgres::Postgres;

static INIT: Once = Once::new();

/// Initialize test environment with RUST_LOG=WARN
pub fn init_test_env() {
    INIT.call_once(|| {
        std::env::set_var("RUST_LOG", "warn");
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// A throwaway PostgreSQL container. Dropping it stops the container.
pub struct TestDatabase {
    pub connection_string: String,
    _container: Container<'static, Postgres>
}

impl TestDatabase {
    pub fn new() -> TestDatabase {
        lazy_static! {
            static ref DOCKER: Arc<Cli> = Arc::new(Cli::default());
        }

        let container = DOCKER.run(Postgres::default());
        let port = container.get_host_port_ipv4(5432);

        TestDatabase {
            connection_string: format!(
                "host=localhost port={} user=postgres password=postgres dbname=postgres",
                port
            ),
            _container: container
        }
    }
}
