//! Shared test fixtures: a scripted microcontroller served over a Unix
//! socket in a temp dir, mirroring the firmware's line protocol.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use tempfile::TempDir;

pub(crate) fn temp_socket() -> (TempDir, String) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir
        .path()
        .join("mcu.sock")
        .to_string_lossy()
        .to_string();
    (dir, path)
}

/// How the simulated firmware reacts to inbound commands.
#[derive(Debug, Clone)]
pub(crate) struct McuBehavior {
    /// Reply `ACK:<echo>` to every non-sort command.
    pub ack_commands: bool,
    /// After acking a `DISPENSE:<d>:<q>`, also emit `DISPENSE_DONE:<d>:<q>`.
    pub dispense_done: bool,
    /// Line sent in response to `SORT:<d>`; `None` stays silent.
    pub sort_reply: Option<String>,
    /// Close the first accepted connection immediately (reconnect tests).
    pub drop_first_connection: bool,
}

impl Default for McuBehavior {
    fn default() -> Self {
        McuBehavior {
            ack_commands: true,
            dispense_done: true,
            sort_reply: Some("OK".to_string()),
            drop_first_connection: false,
        }
    }
}

/// Handle to a running firmware simulator.
pub(crate) struct McuSim {
    received: Arc<Mutex<Vec<String>>>,
    push: mpsc::UnboundedSender<String>,
}

impl McuSim {
    pub fn spawn(path: &str, behavior: McuBehavior) -> McuSim {
        let received = Arc::new(Mutex::new(Vec::new()));
        let (push_tx, push_rx) = mpsc::unbounded_channel::<String>();
        let listener = {
            let std_listener =
                std::os::unix::net::UnixListener::bind(path).expect("bind mock socket");
            std_listener.set_nonblocking(true).expect("nonblocking");
            UnixListener::from_std(std_listener).expect("tokio listener")
        };

        let sim = McuSim {
            received: Arc::clone(&received),
            push: push_tx,
        };

        tokio::spawn(serve(listener, behavior, received, push_rx));
        sim
    }

    /// Injects a raw line as if the firmware sent it spontaneously.
    pub fn push_line(&self, line: &str) {
        self.push.send(line.to_string()).expect("sim running");
    }

    pub fn push_coin(&self, denom: u32) {
        self.push_line(&format!("COIN:{denom}"));
    }

    /// Everything the simulator has read from the controller so far.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().expect("lock").clone()
    }

    /// Number of received lines matching `line` exactly.
    pub fn count_of(&self, line: &str) -> usize {
        self.received().iter().filter(|l| l.as_str() == line).count()
    }

    /// Polls until a line equal to `needle` has been received.
    pub async fn wait_for(&self, needle: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if self.received().iter().any(|line| line == needle) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "mock MCU never received {needle:?}; got {:?}",
                self.received()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

async fn serve(
    listener: UnixListener,
    behavior: McuBehavior,
    received: Arc<Mutex<Vec<String>>>,
    mut push_rx: mpsc::UnboundedReceiver<String>,
) {
    let mut first = true;
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        if behavior.drop_first_connection && first {
            first = false;
            drop(stream);
            continue;
        }
        first = false;
        serve_connection(stream, &behavior, &received, &mut push_rx).await;
    }
}

async fn serve_connection(
    stream: UnixStream,
    behavior: &McuBehavior,
    received: &Arc<Mutex<Vec<String>>>,
    push_rx: &mut mpsc::UnboundedReceiver<String>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { return };
                received.lock().expect("lock").push(line.clone());
                for reply in replies_for(&line, behavior) {
                    if write_half
                        .write_all(format!("{reply}\n").as_bytes())
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            pushed = push_rx.recv() => {
                let Some(pushed) = pushed else { return };
                if write_half
                    .write_all(format!("{pushed}\n").as_bytes())
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

fn replies_for(line: &str, behavior: &McuBehavior) -> Vec<String> {
    if line.starts_with("SORT:") {
        return behavior.sort_reply.iter().cloned().collect();
    }
    let mut replies = Vec::new();
    if behavior.ack_commands {
        replies.push(format!("ACK:{line}"));
    }
    if behavior.dispense_done {
        if let Some(rest) = line.strip_prefix("DISPENSE:") {
            replies.push(format!("DISPENSE_DONE:{rest}"));
        }
    }
    replies
}
