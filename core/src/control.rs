//! Private request/response channel into one running worker.
//!
//! The worker serves HTTP on the Unix socket whose path it received through
//! its environment. Two routes are used: `GET /friends/` for the contact list
//! and `POST /switch/` to toggle message handling.

use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use herd_protocol::ContactRecord;
use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::Method;
use hyper::Request;
use hyper::Uri;
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyperlocal::UnixClientExt;
use hyperlocal::UnixConnector;
use serde_json::Value;
use serde_json::json;

use crate::error::HerdErr;
use crate::error::Result;
use crate::scratch::remove_socket_file;

const CONTACTS_PATH: &str = "/friends/";
const SWITCH_PATH: &str = "/switch/";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ControlChannel {
    address: PathBuf,
    client: Client<UnixConnector, Full<Bytes>>,
    closed: AtomicBool,
}

impl ControlChannel {
    pub fn new(address: PathBuf) -> Self {
        Self {
            address,
            client: Client::unix(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &Path {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fetches the worker's contact list. A closed channel yields an empty
    /// list rather than an error.
    pub async fn list_contacts(&self) -> Result<Vec<ContactRecord>> {
        if self.is_closed() {
            return Ok(Vec::new());
        }
        let body = self
            .send("list_contacts", Method::GET, CONTACTS_PATH, None)
            .await?;
        serde_json::from_value(body).map_err(|err| HerdErr::control("list_contacts", err))
    }

    /// Turns message handling on or off and returns the worker's effective
    /// value.
    pub async fn set_active(&self, active: bool) -> Result<bool> {
        if self.is_closed() {
            return Err(HerdErr::ChannelUnavailable);
        }
        let body = self
            .send(
                "set_active",
                Method::POST,
                SWITCH_PATH,
                Some(json!({ "switch": active })),
            )
            .await?;
        body.as_bool().ok_or_else(|| {
            HerdErr::control("set_active", format!("expected a boolean reply, got {body}"))
        })
    }

    /// Stops accepting calls and removes the socket file. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            remove_socket_file(&self.address);
        }
    }

    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        let uri: Uri = hyperlocal::Uri::new(&self.address, path).into();
        let mut builder = Request::builder().method(method).uri(uri);
        let request_body = match body {
            Some(payload) => {
                builder = builder.header("content-type", "application/json");
                Full::new(Bytes::from(payload.to_string()))
            }
            None => Full::new(Bytes::new()),
        };
        let request = builder
            .body(request_body)
            .map_err(|err| HerdErr::control(operation, err))?;

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|err| HerdErr::control(operation, err))?;
            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|err| HerdErr::control(operation, err))?
                .to_bytes();
            if !status.is_success() {
                return Err(HerdErr::control(
                    operation,
                    format!("worker answered {status}: {}", String::from_utf8_lossy(&bytes)),
                ));
            }
            serde_json::from_slice::<Value>(&bytes).map_err(|err| HerdErr::control(operation, err))
        };

        tokio::time::timeout(REQUEST_TIMEOUT, exchange)
            .await
            .map_err(|_| HerdErr::control(operation, "timed out"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use herd_test_support::FakeWorkerControl;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn lists_contacts_from_the_worker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let address = dir.path().join("ctl");
        let fake = FakeWorkerControl::serve(
            &address,
            vec![json!({"UserName": "@a", "NickName": "Ann", "HeadImgUrl": "/icon/a"})],
        )
        .await;

        let channel = ControlChannel::new(address);
        let contacts = channel.list_contacts().await.expect("contacts");
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].nick_name, "Ann");
        assert_eq!(contacts[0].head_img_url, "/icon/a");
        drop(fake);
    }

    #[tokio::test]
    async fn set_active_returns_the_effective_flag() {
        let dir = tempfile::tempdir().expect("tempdir");
        let address = dir.path().join("ctl");
        let fake = FakeWorkerControl::serve(&address, Vec::new()).await;

        let channel = ControlChannel::new(address);
        assert!(!channel.set_active(false).await.expect("pause"));
        assert!(!fake.handling_messages());
        assert!(channel.set_active(true).await.expect("resume"));
        assert!(fake.handling_messages());
    }

    #[tokio::test]
    async fn closed_channel_degrades_contacts_and_rejects_commands() {
        let dir = tempfile::tempdir().expect("tempdir");
        let address = dir.path().join("ctl");
        let _fake = FakeWorkerControl::serve(&address, vec![json!({"UserName": "@a"})]).await;

        let channel = ControlChannel::new(address.clone());
        channel.close();
        channel.close();

        assert!(!address.exists());
        assert_eq!(channel.list_contacts().await.expect("contacts"), Vec::new());
        assert_matches!(
            channel.set_active(true).await,
            Err(HerdErr::ChannelUnavailable)
        );
    }

    #[tokio::test]
    async fn unbound_address_is_a_control_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channel = ControlChannel::new(dir.path().join("nobody-home"));
        assert_matches!(
            channel.list_contacts().await,
            Err(HerdErr::Control {
                operation: "list_contacts",
                ..
            })
        );
    }
}
