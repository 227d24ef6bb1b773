//! Helpers shared by the herd integration tests: `/bin/sh` fake workers that
//! print the real worker's log lines, and a fake control-plane server.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::routing::get;
use axum::routing::post;
use serde_json::Value;
use tokio::net::UnixListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const LOGIN_CODE_MARKER: &str = "You can also scan QRCode in any website below:";

pub fn login_success_line(nickname: &str) -> String {
    format!(
        "[INFO][2024-05-01 12:30:45][wechat_channel.py:123] - Wechat login success, user_id: @0fa3c9, nickname: {nickname}"
    )
}

pub fn sync_check_failure_line() -> String {
    r#"[ERROR][2024-05-01 13:00:00][login.py:309] - Unexpected sync check result: window.synccheck={retcode:"1101",selector:"0"}"#
        .to_string()
}

/// Program and arguments that run `script` under `/bin/sh`.
pub fn sh_worker(script: &str) -> (PathBuf, Vec<String>) {
    (
        PathBuf::from("/bin/sh"),
        vec!["-c".to_string(), script.to_string()],
    )
}

/// Shell snippet printing each of `lines` on its own line.
pub fn print_lines<S: AsRef<str>>(lines: &[S]) -> String {
    let quoted: Vec<String> = lines.iter().map(|line| quote(line.as_ref())).collect();
    format!("printf '%s\\n' {}", quoted.join(" "))
}

/// Shell snippet printing the login code marker followed by `urls`.
pub fn present_login_code(urls: &[&str]) -> String {
    let mut lines = vec![LOGIN_CODE_MARKER];
    lines.extend_from_slice(urls);
    print_lines(&lines)
}

/// Shell snippet that blocks until [`trigger`] is called with the same name
/// for this worker's control address.
pub fn wait_for_trigger(name: &str) -> String {
    format!("while [ ! -e \"$UNIX_SOCKET_PATH.{name}\" ]; do sleep 0.05; done")
}

pub fn trigger(control_address: &Path, name: &str) {
    let mut path = control_address.as_os_str().to_owned();
    path.push(format!(".{name}"));
    std::fs::write(PathBuf::from(path), b"").expect("write trigger file");
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Stand-in for the worker's control-plane server: `GET /friends/` returns
/// the given contacts, `POST /switch/` flips the message-handling flag.
pub struct FakeWorkerControl {
    state: Arc<FakeState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

struct FakeState {
    contacts: Vec<Value>,
    handling_messages: AtomicBool,
}

impl FakeWorkerControl {
    pub async fn serve(address: &Path, contacts: Vec<Value>) -> Self {
        let listener = UnixListener::bind(address).expect("bind fake control socket");
        let state = Arc::new(FakeState {
            contacts,
            handling_messages: AtomicBool::new(true),
        });
        let app = Router::new()
            .route("/friends/", get(friends))
            .route("/switch/", post(switch))
            .with_state(Arc::clone(&state));

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Self {
            state,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    pub fn handling_messages(&self) -> bool {
        self.state.handling_messages.load(Ordering::SeqCst)
    }
}

impl Drop for FakeWorkerControl {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.task.abort();
    }
}

async fn friends(State(state): State<Arc<FakeState>>) -> Json<Value> {
    Json(Value::Array(state.contacts.clone()))
}

async fn switch(State(state): State<Arc<FakeState>>, Json(body): Json<Value>) -> Json<bool> {
    let on = body.get("switch").and_then(Value::as_bool).unwrap_or(false);
    state.handling_messages.store(on, Ordering::SeqCst);
    Json(on)
}
