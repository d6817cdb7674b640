use overlay_relay::config::Config;
use overlay_relay::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    logging::init_logger("overlay-relay", config.log_verbosity).expect("failed to init logger");
    overlay_relay::run(config).await
}
