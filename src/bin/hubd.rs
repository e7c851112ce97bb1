use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use log::{error, info};
use rust_hub_rpc::{
    InMemoryUserManager, JsonRpcServerBuilder, ServerConfig, TcpServer, ThingsHandler, TransportConfig,
    TransportInterface,
};
use std::path::Path;
use std::sync::Arc;

fn load_config(path: &str) -> anyhow::Result<ServerConfig> {
    let is_yaml = Path::new(path)
        .extension()
        .map(|ext| ext == "yaml" || ext == "yml")
        .unwrap_or(false);
    if is_yaml {
        #[cfg(feature = "yaml-support")]
        return ServerConfig::from_yaml_file(path).with_context(|| format!("loading {}", path));
        #[cfg(not(feature = "yaml-support"))]
        anyhow::bail!("YAML configuration requires the yaml-support feature");
    }
    ServerConfig::from_json_file(path).with_context(|| format!("loading {}", path))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = Command::new("hubd")
        .version(rust_hub_rpc::VERSION)
        .about("JSON-RPC hub server")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Server configuration (JSON, or YAML with the yaml-support feature)"),
        )
        .arg(
            Arg::new("address")
                .short('a')
                .long("address")
                .value_name("ADDR")
                .help("Listen address unless the config file lists transports")
                .default_value("0.0.0.0"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Listen port unless the config file lists transports")
                .value_parser(clap::value_parser!(u16))
                .default_value("2222"),
        )
        .arg(
            Arg::new("no-auth")
                .long("no-auth")
                .help("Disable authentication on the command line transport")
                .action(ArgAction::SetTrue),
        )
        .arg(Arg::new("cert").long("cert").value_name("FILE").help("TLS certificate chain (PEM)"))
        .arg(
            Arg::new("key")
                .long("key")
                .value_name("FILE")
                .help("TLS private key (PEM)")
                .requires("cert"),
        )
        .get_matches();

    let config_file = matches.get_one::<String>("config");
    let mut config = match config_file {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };

    // Without a config file the command line describes the only transport.
    if config_file.is_none() || config.transports.is_empty() {
        config.transports.clear();
        let address = matches
            .get_one::<String>("address")
            .cloned()
            .unwrap_or_else(|| "0.0.0.0".to_string());
        let port = matches.get_one::<u16>("port").copied().unwrap_or(2222);
        let mut transport =
            TransportConfig::new("tcp".to_string(), address, port).with_authentication(!matches.get_flag("no-auth"));
        if let (Some(cert), Some(key)) = (matches.get_one::<String>("cert"), matches.get_one::<String>("key")) {
            transport = transport.with_tls(cert.clone(), key.clone());
        }
        config.transports.push(transport);
    }
    config.validate()?;

    let users = Arc::new(InMemoryUserManager::new().with_push_button(config.push_button_auth_available));
    let mut builder = JsonRpcServerBuilder::new(config.clone(), users)?;
    let things = ThingsHandler::new(builder.notifier())?;
    builder.register_handler(things)?;
    let server = builder.build();

    let mut transports = Vec::new();
    for transport_config in &config.transports {
        let transport = Arc::new(
            TcpServer::new(transport_config.clone())
                .with_context(|| format!("setting up transport {}", transport_config.id))?
                .with_tls_handshake_timeout(config.handshake_timeout),
        );
        let sink = server.register_transport(transport.clone());
        transports.push((transport, sink));
    }
    server.start();

    for (transport, sink) in &transports {
        let address = transport
            .start_server(sink.clone())
            .await
            .with_context(|| format!("starting transport {}", transport.configuration().id))?;
        info!("Listening on {}", address);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for shutdown signal: {}", e);
    }
    info!("Shutting down");
    for (transport, _) in &transports {
        transport.stop_server();
    }
    server.shutdown();
    Ok(())
}
