use std::io::Write;
use std::sync::Arc;

use clap::{App, AppSettings, Arg};

use scp81_admin::config::ServerConfig;
use scp81_admin::event::spawn_log_sink;
use scp81_admin::Scp81Server;

// cargo run --bin scp81d -- --config server.json

fn main() {
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} [{}] {} - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.level(),
                chrono::Local::now().format("%H:%M:%S.%6f"),
                record.args()
            )
        })
        .parse_default_env()
        .init();

    let mut app = App::new("scp81d")
        .version("0.3.0")
        .about("PSK-TLS admin server for GlobalPlatform Amendment B remote administration")
        .setting(AppSettings::DeriveDisplayOrder)
        .arg(
            Arg::with_name("FULLHELP")
                .help("Prints more detailed help information")
                .long("fullhelp"),
        )
        .arg(
            Arg::with_name("config")
                .takes_value(true)
                .short('c')
                .long("config")
                .help("Path to the JSON configuration file"),
        )
        .arg(
            Arg::with_name("host")
                .takes_value(true)
                .long("host")
                .help("Override the configured listen host"),
        )
        .arg(
            Arg::with_name("port")
                .takes_value(true)
                .long("port")
                .help("Override the configured listen port"),
        );

    let matches = app.clone().get_matches();

    if matches.is_present("FULLHELP") {
        app.print_long_help().unwrap();
        std::process::exit(0);
    }

    let mut cfg = match matches.value_of("config") {
        Some(path) => match ServerConfig::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                log::error!("{e}");
                std::process::exit(2);
            }
        },
        None => ServerConfig::default(),
    };
    if let Some(host) = matches.value_of("host") {
        cfg.host = host.to_owned();
    }
    if let Some(port) = matches.value_of("port") {
        match port.parse() {
            Ok(port) => cfg.port = port,
            Err(_) => {
                log::error!("invalid port {port:?}");
                std::process::exit(2);
            }
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.thread_pool_size)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("unable to build runtime: {e}");
            std::process::exit(3);
        }
    };

    std::process::exit(runtime.block_on(serve(cfg)));
}

async fn serve(cfg: ServerConfig) -> i32 {
    let server = match Scp81Server::new(cfg) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            log::error!("startup failed: {e}");
            return 2;
        }
    };

    spawn_log_sink(server.event_bus());

    if let Err(e) = server.bind().await {
        log::error!("{e}");
        return 3;
    }

    let runner = Arc::clone(&server);
    let serving = tokio::spawn(async move { runner.run().await });

    match tokio::signal::ctrl_c().await {
        Ok(()) => server.shutdown("interrupted").await,
        Err(e) => {
            log::error!("unable to wait for shutdown signal: {e}");
            server.shutdown("signal handling unavailable").await;
        }
    }

    match serving.await {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            log::error!("{e}");
            1
        }
        Err(e) => {
            log::error!("server task failed: {e}");
            1
        }
    }
}
