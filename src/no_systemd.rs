use clap::{ArgMatches, Command};
use log::info;

pub fn add_args<'a>(app_args: Command<'a>) -> Command<'a> {
    app_args
}

pub fn init_logging() {
    tracing_subscriber::fmt::init();
}

pub fn start(_args: &ArgMatches) {
    init_logging();
    starting();
}

pub fn starting() {
    info!("Alarm server starting");
}

pub fn ready() {
    info!("Alarm server ready");
}

pub fn exiting() {
    info!("Alarm server exiting");
}
