//! HTTP dispatcher: one POST per message.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use http::Uri;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::sync::watch;

use fugue_transport::Message;

use crate::dispatcher::Dispatcher;
use crate::error::SidecarError;

pub struct HttpDispatcher {
    client: Client<HttpConnector, Full<Bytes>>,
    uri: Uri,
    closed: watch::Receiver<bool>,
    // Kept so the closed signal can never fire.
    _closed_tx: watch::Sender<bool>,
}

impl HttpDispatcher {
    pub fn new(port: u16) -> Result<Self, SidecarError> {
        let uri: Uri = format!("http://127.0.0.1:{port}/")
            .parse()
            .map_err(|e: http::uri::InvalidUri| SidecarError::DispatcherConnect(e.to_string()))?;
        let (closed_tx, closed) = watch::channel(false);
        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            uri,
            closed,
            _closed_tx: closed_tx,
        })
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&mut self, message: Message) -> Result<Option<Message>, SidecarError> {
        let (payload, headers) = message.into_parts();

        let mut builder = Request::post(self.uri.clone());
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        let request = builder
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| SidecarError::Dispatch(e.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| SidecarError::Dispatch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SidecarError::Dispatch(format!(
                "function returned status {}",
                response.status()
            )));
        }

        let mut reply_headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                reply_headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| SidecarError::Dispatch(e.to_string()))?
            .to_bytes();

        Ok(Some(Message::from_parts(body.to_vec(), reply_headers)))
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }
}
