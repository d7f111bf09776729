//! The Dispatch Layer: resolves a normalized plugin id to its `BackendHandler` and
//! delegates the whole request to it.

use std::collections::HashMap;
use std::sync::Arc;

use crate::forwarded;
use crate::handlers::BackendHandler;

pub struct Dispatcher {
    handlers: HashMap<&'static str, Arc<dyn BackendHandler>>,
    log: slog::Logger,
}

impl Dispatcher {
    pub fn new(
        powerflex: Arc<dyn BackendHandler>,
        powermax: Arc<dyn BackendHandler>,
        powerscale: Arc<dyn BackendHandler>,
        log: slog::Logger,
    ) -> Self {
        let mut handlers: HashMap<&'static str, Arc<dyn BackendHandler>> = HashMap::new();
        handlers.insert("powerflex", powerflex);
        handlers.insert("powermax", powermax);
        handlers.insert("powerscale", powerscale);
        Dispatcher { handlers, log }
    }

    pub async fn dispatch(&self, req: http::Request<hyper::Body>) -> http::Response<hyper::Body> {
        let identifier = forwarded::parse(req.headers());

        let Some(by) = identifier.by.as_deref() else {
            slog::warn!(self.log, "request missing Forwarded 'by' segment");
            return plugin_not_found_response();
        };

        let family = forwarded::normalize_plugin_id(by);
        let Some(handler) = self.handlers.get(family.as_str()) else {
            slog::warn!(self.log, "unknown plugin id"; "by" => by);
            return plugin_not_found_response();
        };

        let Some((_endpoint, system_id)) = identifier.endpoint_and_system() else {
            slog::warn!(self.log, "request missing Forwarded 'for' segment");
            return plugin_not_found_response();
        };

        handler.serve(&system_id, req).await
    }
}

fn plugin_not_found_response() -> http::Response<hyper::Body> {
    http::Response::builder()
        .status(http::StatusCode::BAD_GATEWAY)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(hyper::Body::from(
            serde_json::json!({
                "errorCode": 502,
                "httpStatusCode": 502,
                "message": "plugin id not found",
            })
            .to_string(),
        ))
        .unwrap_or_else(|_| http::Response::new(hyper::Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StubHandler(http::StatusCode);

    #[async_trait]
    impl BackendHandler for StubHandler {
        async fn serve(&self, _system_id: &str, _req: http::Request<hyper::Body>) -> http::Response<hyper::Body> {
            http::Response::builder()
                .status(self.0)
                .body(hyper::Body::empty())
                .unwrap()
        }

        async fn update_systems(&self, _config: &crate::config::SystemConfig) {}
    }

    fn dispatcher() -> Dispatcher {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        Dispatcher::new(
            Arc::new(StubHandler(http::StatusCode::OK)),
            Arc::new(StubHandler(http::StatusCode::OK)),
            Arc::new(StubHandler(http::StatusCode::OK)),
            log,
        )
    }

    #[tokio::test]
    async fn unknown_plugin_id_yields_502() {
        let dispatcher = dispatcher();
        let req = http::Request::builder()
            .header(http::header::FORWARDED, "by=csi-unknownthing,for=e;s")
            .body(hyper::Body::empty())
            .unwrap();
        let resp = dispatcher.dispatch(req).await;
        assert_eq!(resp.status(), http::StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn known_synonym_routes_to_powerflex() {
        let dispatcher = dispatcher();
        let req = http::Request::builder()
            .header(http::header::FORWARDED, "by=csi-vxflexos,for=e;s0")
            .body(hyper::Body::empty())
            .unwrap();
        let resp = dispatcher.dispatch(req).await;
        assert_eq!(resp.status(), http::StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_forwarded_header_yields_502() {
        let dispatcher = dispatcher();
        let req = http::Request::builder().body(hyper::Body::empty()).unwrap();
        let resp = dispatcher.dispatch(req).await;
        assert_eq!(resp.status(), http::StatusCode::BAD_GATEWAY);
    }
}
