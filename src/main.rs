use anyhow::Result;
use callbridge::app::{run, AppStateBuilder};
use callbridge::config::{Cli, Config};
use callbridge::version::get_version_info;
use clap::Parser;
use dotenv::dotenv;
use std::fs::File;
use tokio::select;
use tracing::{info, level_filters::LevelFilter};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let mut config = cli
        .conf
        .filter(|conf| std::path::Path::new(conf).exists())
        .map(|conf| Config::load(&conf).expect("Failed to load config"))
        .unwrap_or_default();
    config.apply_env();

    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }

    let _guard;
    if let Some(ref log_file) = config.log_file {
        let file = File::create(log_file).expect("Failed to create log file");
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        _guard = guard;
        log_fmt.with_writer(non_blocking).try_init().ok();
    } else {
        log_fmt.try_init().ok();
    }

    info!("{}", get_version_info());

    let state = AppStateBuilder::new()
        .config(config)
        .build()
        .expect("Failed to build app state");

    info!("Starting callbridge on {}", state.config.http_addr);
    let token = state.token.clone();
    select! {
        result = run(state) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received CTRL+C, shutting down");
            token.cancel();
        }
    }
    Ok(())
}
