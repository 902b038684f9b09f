use beacon_link::settings::{
    CONFIG_VALUE_FIELD, DEVICE_NAME_KEY, SILENT_MODE_KEY, TIME_24_HOUR_KEY, USER_ID_KEY,
};
use beacon_sim::{FileFlash, SimConfig, SimError, Simulator};
use clap::Parser;
use rmpv::Value;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "beacon-sim")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding the simulated partitions.
    #[arg(long, default_value = "beacon-flash")]
    flash_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Pair with the device and push a firmware image over the link.
    Flash {
        image: PathBuf,
        #[arg(long, default_value_t = 1024)]
        chunk_size: usize,
        /// Restart into the new image once it is committed.
        #[arg(long, default_value_t = false)]
        reboot: bool,
    },
    /// Print the partition table.
    Status,
    /// Read or change device settings.
    Settings {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        user_id: Option<u64>,
        #[arg(long)]
        silent: Option<bool>,
        #[arg(long)]
        time_24_hour: Option<bool>,
    },
    /// Dump the display as text.
    Screen,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("beacon-sim error: {}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), SimError> {
    let config = match &cli.config {
        Some(path) => SimConfig::from_path(path)?,
        None => SimConfig::default(),
    };
    let flash = FileFlash::open(&cli.flash_dir, &config.flash)?;

    match cli.command {
        Command::Status => print_json(&flash.status()),
        Command::Flash { image, chunk_size, reboot } => {
            let image = fs::read(&image)?;
            let sim = Simulator::start(config, flash);
            let companion = sim.companion();
            companion.connect_and_pair().await?;
            let report = companion.flash_image(&image, chunk_size).await?;
            companion.disconnect(0x13).await?;
            drop(companion);
            if reboot {
                let running = sim.with_storage(|flash| {
                    flash.reboot().map(|()| flash.running_partition())
                })??;
                log::info!("sim: rebooted into {}", running);
            }
            sim.shutdown().await?;
            print_json(&report)
        }
        Command::Settings { name, user_id, silent, time_24_hour } => {
            let sim = Simulator::start(config, flash);
            let companion = sim.companion();
            companion.connect_and_pair().await?;
            let mut changes = Vec::new();
            if let Some(name) = name {
                changes.push((DEVICE_NAME_KEY, config_value(Value::from(name))));
            }
            if let Some(user_id) = user_id {
                changes.push((USER_ID_KEY, config_value(Value::from(user_id))));
            }
            if let Some(silent) = silent {
                changes.push((SILENT_MODE_KEY, config_value(Value::from(silent))));
            }
            if let Some(time_24_hour) = time_24_hour {
                changes.push((TIME_24_HOUR_KEY, config_value(Value::from(time_24_hour))));
            }
            let reply = if changes.is_empty() {
                companion.call("get_settings", Vec::new()).await?
            } else {
                companion.call("update_settings", changes).await?
            };
            drop(companion);
            sim.shutdown().await?;
            print_json(&reply.to_value())
        }
        Command::Screen => {
            let sim = Simulator::start(config, flash);
            let companion = sim.companion();
            companion.connect_and_pair().await?;
            let lines = companion.screen().await?;
            drop(companion);
            sim.shutdown().await?;
            for line in lines {
                println!("{line}");
            }
            Ok(())
        }
    }
}

fn config_value(value: Value) -> Value {
    Value::Map(vec![(Value::from(CONFIG_VALUE_FIELD), value)])
}

fn print_json<T: Serialize>(value: &T) -> Result<(), SimError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
