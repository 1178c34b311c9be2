// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use tokio::sync::mpsc;

/// Shutdown resolves on SIGINT, SIGTERM or an explicit [ShutdownTrigger].
pub struct Shutdown {
    trigger: ShutdownTrigger,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Shutdown {
            trigger: ShutdownTrigger { shutdown_tx },
            shutdown_rx,
        }
    }

    pub fn trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    /// Completes once shutdown should start.
    pub async fn wait(mut self) {
        tokio::select! {
            _ = imp::shutdown() => {}
            _ = self.shutdown_rx.recv() => {}
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
    shutdown_tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
    pub async fn shutdown_now(&self) {
        // a full channel means a shutdown is already pending
        let _ = self.shutdown_tx.try_send(());
    }
}

#[cfg(unix)]
mod imp {
    use tokio::signal::unix::{SignalKind, signal};
    use tracing::{error, info};

    pub(super) async fn shutdown() {
        tokio::select! {
            () = watch_signal(SignalKind::interrupt(), "SIGINT") => {}
            () = watch_signal(SignalKind::terminate(), "SIGTERM") => {}
        };
    }

    async fn watch_signal(kind: SignalKind, name: &'static str) {
        match signal(kind) {
            Ok(mut s) => {
                s.recv().await;
                info!("received signal {name}, starting shutdown");
            }
            Err(e) => {
                error!("failed to register {name} handler: {e}");
                std::future::pending::<()>().await
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    pub(super) async fn shutdown() {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await
        }
    }
}
