use std::sync::Arc;

use git_version::git_version;
use slog::*;
use structopt::StructOpt;

mod claims;
mod config;
mod dispatch;
mod enforcement;
mod error;
mod forwarded;
mod handlers;
mod ledger;
mod policy;
mod pool_cache;
mod proxy;
mod server;
mod session;

use config::Opt;
use dispatch::Dispatcher;
use handlers::powerflex::PowerFlexHandler;
use handlers::powermax::PowerMaxHandler;
use handlers::powerscale::PowerScaleHandler;
use handlers::BackendHandler;
use ledger::{Ledger, RedisLedger, SharedLedger};
use policy::PolicyClient;

#[tokio::main]
async fn main() {
    const GIT_VERSION: &str = git_version!(
        args = ["--long", "--all", "--always", "--dirty=-modified"],
        fallback = "unknown"
    );

    let opt = Opt::from_args();

    let log_decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let drain = slog_term::CompactFormat::new(log_decorator).build().fuse();

    let log_level = if opt.verbose { Level::Debug } else { Level::Info };
    let drain = slog::LevelFilter::new(drain, log_level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    let root_log = slog::Logger::root(
        drain.fuse(),
        slog::o!("build" => GIT_VERSION, "pkg-version" => env!("CARGO_PKG_VERSION")),
    );

    slog::info!(root_log, "starting authz-proxy"; "config" => opt.config.display().to_string(), "bind" => opt.bind.to_string());

    let system_config = config::load_system_config(&opt.config)
        .unwrap_or_else(|e| panic!("failed to load system config {}: {}", opt.config.display(), e));

    let ledger: SharedLedger = Arc::new(
        RedisLedger::connect(&opt.redis_url, root_log.new(o!("component" => "ledger")))
            .await
            .expect("failed to connect to ledger store"),
    );
    ledger.ping().await.expect("ledger store is not reachable at startup");

    let policy = PolicyClient::new(opt.policy_host.clone(), root_log.new(o!("component" => "policy")));

    let powerflex: Arc<dyn BackendHandler> = Arc::new(PowerFlexHandler::new(
        ledger.clone(),
        policy.clone(),
        root_log.new(o!("handler" => "powerflex")),
    ));
    let powermax: Arc<dyn BackendHandler> = Arc::new(PowerMaxHandler::new(
        ledger.clone(),
        policy.clone(),
        root_log.new(o!("handler" => "powermax")),
    ));
    let powerscale: Arc<dyn BackendHandler> = Arc::new(PowerScaleHandler::new(
        ledger.clone(),
        policy.clone(),
        root_log.new(o!("handler" => "powerscale")),
    ));

    powerflex.update_systems(&system_config).await;
    powermax.update_systems(&system_config).await;
    powerscale.update_systems(&system_config).await;

    let dispatcher = Arc::new(Dispatcher::new(
        powerflex.clone(),
        powermax.clone(),
        powerscale.clone(),
        root_log.new(o!("component" => "dispatch")),
    ));

    // Reload on SIGHUP by re-decoding the config file and re-running UpdateSystems on every
    // handler. A handler that fails to build one system keeps its previous state for that
    // system rather than dropping it.
    let reload_log = root_log.new(o!("component" => "reload"));
    let reload_path = opt.config.clone();
    let reload_handlers = (powerflex, powermax, powerscale);
    tokio::spawn(async move {
        let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                slog::error!(reload_log, "failed to install SIGHUP handler"; "error" => e.to_string());
                return;
            }
        };
        loop {
            hangup.recv().await;
            slog::info!(reload_log, "reloading system config"; "path" => reload_path.display().to_string());
            match config::load_system_config(&reload_path) {
                Ok(fresh) => {
                    reload_handlers.0.update_systems(&fresh).await;
                    reload_handlers.1.update_systems(&fresh).await;
                    reload_handlers.2.update_systems(&fresh).await;
                }
                Err(e) => {
                    slog::error!(reload_log, "failed to reload system config, keeping previous state"; "error" => e.to_string());
                }
            }
        }
    });

    let server = server::Server::new(opt.bind, dispatcher, root_log.new(o!("component" => "server")));

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(e) = server.run(shutdown).await {
        slog::error!(root_log, "server exited with error"; "error" => e.to_string());
    }
}
