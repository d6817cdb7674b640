pub mod config;
pub mod crypto;
pub mod device;
pub mod domain;
pub mod error;
pub mod frame;
pub mod location;
pub mod logging;
pub mod net;
pub mod persistence;
pub mod session;

pub use config::Config;

pub async fn run(config: Config) -> anyhow::Result<()> {
    net::server::run(config).await
}
