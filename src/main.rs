use meterpoll::{Config, ModbusManager};
use std::{env, path::PathBuf, process::ExitCode};
use log::{error, info};


#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    let default_filter = std::env::var("METERPOLL_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    /* an explicit config path may be given as first argument */
    let path = env::args().nth(1).map(PathBuf::from);
    let config = match Config::load(path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut modbus = ModbusManager::new(config);
    info!("Starting Modbus polling");
    if let Err(e) = modbus.start_thread().await {
        error!("Modbus stopped: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
