use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use gateway_console::api::GatewayClient;
use gateway_console::api::models::Status;
use gateway_console::app::Settings;
use gateway_console::controller::view::Level;
use gateway_console::controller::{
    self, Event, HttpTransport, LocalTransport, PairingView, ProxyTransport, Timing, UiEvent,
};
use gateway_console::proxy::Proxy;
use gateway_console::server::{self, API_PATH};
use gateway_console::utils::normalize_url;

#[derive(Parser)]
#[command(name = "gateway-console", version, about = "Messaging gateway control panel")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the proxy server.
    Serve,
    /// Pair one instance and report progress until it is linked or gives up.
    Pair {
        /// Instance key to pair.
        #[arg(long)]
        instance: String,
        /// Proxy to go through, e.g. http://127.0.0.1:8080. Without it the
        /// proxy runs in-process with the configured defaults.
        #[arg(long, env = "GWC_PROXY")]
        proxy: Option<String>,
    },
    /// List the gateway's instances.
    Instances {
        #[arg(long, env = "GWC_PROXY")]
        proxy: Option<String>,
    },
    /// Write the default settings file.
    InitConfig,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = Settings::load();
    env_logger::Builder::new()
        .parse_filters(&settings.log_filter)
        .parse_default_env()
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let result = runtime.block_on(run(cli.command.unwrap_or(Command::Serve), settings));
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Serve => server::serve(&settings).await?,
        Command::InitConfig => {
            let path = settings.save()?;
            log::info!("wrote {}", path.display());
        }
        Command::Instances { proxy } => {
            let (handle, mut ui, join) = controller::spawn(transport(proxy, &settings)?, quiet());
            handle.send(Event::LoadInstances)?;
            while let Some(event) = ui.recv().await {
                match event {
                    UiEvent::Instances(cards) => {
                        for card in cards {
                            println!("{}\t{}\t{}", card.instance_key, card.phone_number, card.status);
                        }
                        break;
                    }
                    UiEvent::Notify { level: Level::Error, message } => {
                        handle.shutdown();
                        return Err(message.into());
                    }
                    _ => {}
                }
            }
            handle.shutdown();
            join.await?;
        }
        Command::Pair { instance, proxy } => {
            let (handle, mut ui, join) = controller::spawn(transport(proxy, &settings)?, quiet());
            handle.send(Event::SelectInstance {
                instance_key: instance.clone(),
                phone_number: instance.clone(),
                status: Status::Other("UNKNOWN".into()),
            })?;
            let outcome = loop {
                let next = tokio::select! {
                    event = ui.recv() => Some(event),
                    _ = tokio::signal::ctrl_c() => None,
                };
                let Some(event) = next else {
                    break Err("interrupted".to_string());
                };
                let Some(event) = event else {
                    break Err("controller stopped".to_string());
                };
                match event {
                    UiEvent::Selected { .. } => handle.send(Event::StartPairing)?,
                    UiEvent::Notify { level, message } => match level {
                        Level::Error => log::warn!("{}", message),
                        _ => log::info!("{}", message),
                    },
                    UiEvent::StatusIndicator(status) => log::info!("status: {}", status),
                    UiEvent::Pairing(view) if view.is_final() => {
                        break match view {
                            PairingView::Paired(message) => Ok(message),
                            PairingView::TimedOut => Err("timed out waiting for a code".to_string()),
                            PairingView::Error(message) => Err(message),
                            other => Err(format!("pairing stopped at {:?}", other)),
                        };
                    }
                    UiEvent::Pairing(PairingView::Loading { message, detail }) => {
                        log::info!("{} {}", message, detail.unwrap_or_default())
                    }
                    UiEvent::Pairing(PairingView::Code(code)) => println!("scan this code: {:?}", code),
                    _ => {}
                }
            };
            handle.shutdown();
            join.await?;
            println!("{}", outcome?);
        }
    }
    Ok(())
}

fn quiet() -> Timing {
    Timing { message_refresh: None, ..Timing::default() }
}

fn transport(proxy: Option<String>, settings: &Settings) -> Result<Arc<dyn ProxyTransport>, Box<dyn std::error::Error>> {
    Ok(match proxy {
        Some(url) => {
            let url = normalize_url(&url);
            let endpoint = format!("{}{}", url.trim_end_matches('/'), API_PATH);
            Arc::new(HttpTransport::new(endpoint)?)
        }
        None => Arc::new(LocalTransport::new(Proxy::new(GatewayClient::new(settings)?, settings))),
    })
}
