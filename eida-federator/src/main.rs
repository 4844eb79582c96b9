use std::rc::Rc;

use anyhow::{bail, Result};
use clap::Parser;
use eida_federator_core::{Cli, GatewayConfig};
use eida_federator_services::SlotPool;
use hyper_util::server::conn::auto::Builder;
use monoio::io::IntoPollIo;
use monoio::net::{ListenerConfig, TcpListener};
use monoio_compat::hyper::{MonoioExecutor, MonoioIo};
use tracing::{error, info, warn};

mod ingress;
mod orphan_cleanup;

#[monoio::main(timer_enabled = true)]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = GatewayConfig::build(cli)?;
    init_tracing(config.debug);

    orphan_cleanup::sweep(&config.tmpdir);

    let config = Rc::new(config);
    let slot_pool = SlotPool::new(config.default_slot_capacity, config.slot_poll_interval);
    for (url, capacity) in &config.slot_capacities {
        slot_pool.set_capacity(url, *capacity);
    }

    let ctx = ingress::Ctx {
        config: config.clone(),
        slot_pool,
    };

    let listener = match TcpListener::bind_with_config(config.bind_addr, &ListenerConfig::default())
    {
        Ok(listener) => listener,
        Err(e) => bail!("failed binding {}: {e}", config.bind_addr),
    };
    info!("eida-federator listening on {}", config.bind_addr);

    let builder = Builder::new(MonoioExecutor);
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };

        let ctx = ctx.clone();
        let builder = builder.clone();
        monoio::spawn(async move {
            let poll_io = match stream.into_poll_io() {
                Ok(poll_io) => poll_io,
                Err(e) => {
                    warn!("failed adapting accepted stream from {peer_addr}: {e}");
                    return;
                }
            };
            let io = MonoioIo::new(poll_io);
            let service = hyper::service::service_fn(move |req| ingress::handle(req, ctx.clone()));
            if let Err(e) = builder.serve_connection(io, service).await {
                error!("connection from {peer_addr} ended with error: {e}");
            }
        });
    }
}

fn init_tracing(debug: bool) {
    use tracing_subscriber::EnvFilter;

    let default_directive = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
