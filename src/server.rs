//! HTTP transport and process lifecycle.
//!
//! Bind once, spawn one task per unit of incoming work, let tasks outlive the loop that spawned
//! them, built on a `hyper` `make_service_fn`/`service_fn` pair since the unit of work here is an
//! HTTP request.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};

use crate::dispatch::Dispatcher;

pub struct Server {
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    log: slog::Logger,
}

impl Server {
    pub fn new(addr: SocketAddr, dispatcher: Arc<Dispatcher>, log: slog::Logger) -> Self {
        Server { addr, dispatcher, log }
    }

    /// Run the listener until `shutdown` resolves, then stop accepting and wait for in-flight
    /// requests to finish.
    pub async fn run(self, shutdown: impl std::future::Future<Output = ()>) -> Result<(), hyper::Error> {
        let dispatcher = self.dispatcher;
        let log = self.log.clone();

        let make_svc = make_service_fn(move |_conn: &AddrStream| {
            let dispatcher = dispatcher.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let dispatcher = dispatcher.clone();
                    async move { Ok::<_, Infallible>(dispatcher.dispatch(req).await) }
                }))
            }
        });

        slog::info!(log, "listening"; "addr" => self.addr.to_string());
        hyper::Server::bind(&self.addr)
            .serve(make_svc)
            .with_graceful_shutdown(shutdown)
            .await
    }
}
