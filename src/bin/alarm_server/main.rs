use alarm_server::automated_actions::LogActionPerformer;
use alarm_server::commands::{AlarmCommands, ServerControl};
use alarm_server::daemon;
use alarm_server::scheduler::TokioScheduler;
use alarm_server::server_model::ServerModel;
use alarm_server::settings::{read_settings, ServerSettings};
use alarm_server::state_initializer::read_initial_states;
use alarm_server::topic::kafka::{KafkaConsumer, KafkaProducer};
use alarm_server::topic::StartFrom;
use alarm_server::util::error::DynResult;
use alarm_server::value_source::LocalValueSource;
use clap::{Arg, Command};
use git_version::git_version;
use log::{error, info};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

const INITIAL_STATE_TIMEOUT: Duration = Duration::from_secs(2);

fn start_model(
    settings: &ServerSettings,
    source: Arc<LocalValueSource>,
    control: UnboundedSender<ServerControl>,
) -> DynResult<Arc<ServerModel>> {
    let topics = settings.topics();
    let mut state_consumer = KafkaConsumer::new(
        &settings.server,
        &[(topics.config.as_str(), StartFrom::Beginning)],
    )?;
    let initial_states = read_initial_states(&mut state_consumer, INITIAL_STATE_TIMEOUT)?;
    drop(state_consumer);

    let producer = Arc::new(KafkaProducer::new(&settings.server)?);
    let consumer = KafkaConsumer::new(
        &settings.server,
        &[
            (topics.config.as_str(), StartFrom::Beginning),
            (topics.command.as_str(), StartFrom::End),
        ],
    )?;
    let model = ServerModel::new(
        settings,
        producer,
        source,
        TokioScheduler::current(),
        Arc::new(LogActionPerformer),
        Arc::new(AlarmCommands::new(control)),
        initial_states,
    );
    model.start(Box::new(consumer))?;
    Ok(model)
}

#[tokio::main]
async fn main() {
    let version = env!("CARGO_PKG_VERSION").to_string() + " " + git_version!();
    let app_args = Command::new("Alarm server")
        .version(version.as_str())
        .about("Alarm server publishing alarm states through Kafka")
        .arg(Arg::new("SETTINGS").help("Settings file (JSON)"))
        .arg(
            Arg::new("config")
                .long("config")
                .takes_value(true)
                .help("Alarm configuration name"),
        )
        .arg(
            Arg::new("server")
                .long("server")
                .takes_value(true)
                .help("Kafka bootstrap servers, host:port"),
        );
    let app_args = daemon::add_args(app_args);
    let args = app_args.get_matches();

    daemon::start(&args);

    let mut settings = match read_settings(args.value_of("SETTINGS").map(Path::new)) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to read settings: {}", e);
            return;
        }
    };
    if let Some(config) = args.value_of("config") {
        settings.config_name = config.to_string();
    }
    if let Some(server) = args.value_of("server") {
        settings.server = server.to_string();
    }
    info!(
        "Alarm configuration '{}' on {}",
        settings.config_name, settings.server
    );

    let source = LocalValueSource::new();
    let (control_tx, mut control_rx) = unbounded_channel();
    let mut ready = false;
    loop {
        let model = match tokio::task::block_in_place(|| {
            start_model(&settings, source.clone(), control_tx.clone())
        }) {
            Ok(model) => model,
            Err(e) => {
                error!("Failed to start alarm server: {}", e);
                break;
            }
        };
        if !ready {
            daemon::ready();
            ready = true;
        }
        let restart = tokio::select! {
            res = signal::ctrl_c() => {
                if let Err(e) = res {
                    error!("Failed to wait for ctrl-c: {}", e);
                }
                false
            },
            control = control_rx.recv() => {
                matches!(control, Some(ServerControl::Restart))
            }
        };
        tokio::task::block_in_place(|| model.shutdown());
        if !restart {
            break;
        }
        info!("Restarting");
    }

    daemon::exiting();
}
