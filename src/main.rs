use std::sync::Arc;

use clap::Parser;
use ircbouncer::bouncer;
use ircbouncer::bus::EventBus;
use ircbouncer::config::Config;
use ircbouncer::net::Reactor;

#[derive(Parser, Debug)]
#[command(about = "IRC bouncer")]
struct Opt {
    /// Path to the bouncer's YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    conf: String,
}

const SOCKETS_POLLED_PERIOD: std::time::Duration = std::time::Duration::from_millis(100);

fn main() -> std::io::Result<()> {
    let bus = Arc::new(EventBus::new());
    ircbouncer::logging::init(bus.clone());

    let opt = Opt::parse();
    let config = Config::load_from_yaml(&opt.conf).unwrap_or_else(|e| {
        log::error!("failed to load configuration from {}: {e}", opt.conf);
        std::process::exit(1);
    });

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        Reactor::new(bus.clone()).spawn(SOCKETS_POLLED_PERIOD);

        let (results, listen_result) = bouncer::start_all(bus, &config).await;
        let mut any_started = false;
        for result in results {
            match result {
                Ok(b) => {
                    any_started = true;
                    log::info!("bouncer '{}' registered", b.name);
                }
                Err(e) => log::error!("failed to build bouncer: {e}"),
            }
        }

        if let Err(e) = listen_result {
            log::error!("failed to bind client listener on port {}: {e}", config.proxy_port);
            std::process::exit(1);
        }

        if !any_started {
            log::error!("no bouncer started successfully, exiting");
            std::process::exit(1);
        }

        // The current-thread runtime's only job from here on is driving
        // the tasks `bouncer::start_all` spawned (accept loops, read
        // loops, the sockets_polled reactor tick); park forever.
        std::future::pending::<()>().await;
    });

    Ok(())
}
