use clap::Parser as _;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};
use tuya2mqtt::commands;

const LOG_FILTER_VARIABLE: &str = "TUYA2MQTT_LOG";

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Sensors(commands::sensors::Args),
    Decode(commands::decode::Args),
    Discovery(commands::discovery::Args),
    Bridge(commands::bridge::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let filter_description =
        std::env::var(LOG_FILTER_VARIABLE).unwrap_or_else(|_| String::from("info"));
    let filter = match filter_description.parse::<tracing_subscriber::filter::targets::Targets>() {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("error: could not parse {LOG_FILTER_VARIABLE}");
            eprintln!("  because: {e}");
            std::process::exit(1);
        }
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Sensors(args) => end(commands::sensors::run(args)),
        Commands::Decode(args) => end(commands::decode::run(args)),
        Commands::Discovery(args) => end(commands::discovery::run(args)),
        Commands::Bridge(args) => end(commands::bridge::run(args)),
    }
}
