//! Chat loop: terminal input, transport events and handshake deadlines.

use std::{path::Path, time::Instant};

use parley_client::{
    ClientError, CoordinatorAction, Environment, SessionCoordinator, SystemEnv,
    transport::RealtimeClient,
};
use parley_core::TransportEvent;
use parley_crypto::EncryptedEnvelope;
use parley_vault::{RedbStorage, UnavailableSecureStore};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout},
    sync::mpsc::UnboundedReceiver,
};
use tracing::{debug, info, warn};

use crate::{
    error::CliError,
    input::{self, HELP, Input},
    render,
};

/// Coordinator as wired by the binary.
pub type Coordinator = SessionCoordinator<RedbStorage, UnavailableSecureStore, SystemEnv>;

/// Interactive chat session.
pub struct App {
    env: SystemEnv,
    coordinator: Coordinator,
    client: RealtimeClient,
    peer: Option<String>,
    out: Stdout,
}

impl App {
    /// Wire the loop around already-built components.
    pub fn new(
        env: SystemEnv,
        coordinator: Coordinator,
        client: RealtimeClient,
        peer: Option<String>,
    ) -> Self {
        Self { env, coordinator, client, peer, out: tokio::io::stdout() }
    }

    /// Run until `/quit`, end of input or a fatal connection error.
    pub async fn run(mut self, mut events: UnboundedReceiver<TransportEvent>) -> Result<(), CliError> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let result = loop {
            let deadline = self.coordinator.next_deadline();

            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break Ok(()) };
                    match input::parse(&line) {
                        Ok(Input::Quit) => break Ok(()),
                        Ok(input) => {
                            if let Err(e) = self.handle_input(input).await {
                                self.print(&format!("! {e}")).await?;
                            }
                        },
                        Err(e) => self.print(&format!("! {e}")).await?,
                    }
                },
                event = events.recv() => {
                    let Some(event) = event else { break Err(CliError::Client(ClientError::DriverStopped)) };
                    if let Err(e) = self.handle_transport(event).await {
                        break Err(e);
                    }
                },
                () = sleep_until(deadline) => {
                    let actions = self.coordinator.tick(self.env.now());
                    self.apply(actions).await?;
                },
            }
        };

        info!("leaving");
        self.client.disconnect().await?;
        result
    }

    async fn handle_input(&mut self, input: Input) -> Result<(), CliError> {
        let now = self.env.now();
        match input {
            Input::Empty | Input::Quit => Ok(()),
            Input::Help => self.print(HELP).await,
            Input::Say(text) => {
                let peer = self.selected()?;
                match self.coordinator.encrypt(&peer, text.as_bytes()) {
                    Ok(message) => Ok(self.client.send(message).await?),
                    Err(ClientError::NoSession { .. }) => {
                        let state = render::state(self.coordinator.state(&peer));
                        self.print(&format!("! no session with {peer} yet ({state})")).await
                    },
                    Err(ClientError::SessionExpired { .. }) => {
                        self.print(&format!("! session with {peer} expired, renegotiating")).await?;
                        let actions = self.coordinator.ensure_session(&peer, now)?;
                        self.apply(actions).await
                    },
                    Err(e) => Err(e.into()),
                }
            },
            Input::Peer(peer) => {
                let actions = self.coordinator.ensure_session(&peer, now)?;
                self.peer = Some(peer.clone());
                self.print(&format!("* talking to {peer} ({})", render::state(self.coordinator.state(&peer))))
                    .await?;
                self.apply(actions).await
            },
            Input::Rotate => {
                let peer = self.selected()?;
                let actions = self.coordinator.rotate(&peer, now)?;
                self.apply(actions).await
            },
            Input::Close => {
                let peer = self.selected()?;
                let actions = self.coordinator.teardown(&peer)?;
                self.apply(actions).await
            },
            Input::CloseAll => {
                let actions = self.coordinator.teardown_all()?;
                self.apply(actions).await
            },
            Input::Sessions => {
                let mut sessions: Vec<_> = self
                    .coordinator
                    .sessions()
                    .map(|(peer, state)| format!("  {peer}: {}", render::state(state)))
                    .collect();
                sessions.sort();
                if sessions.is_empty() {
                    return self.print("* no sessions").await;
                }
                self.print(&sessions.join("\n")).await
            },
            Input::Backup(path) => self.backup(&path).await,
            Input::Restore(path) => self.restore(&path).await,
        }
    }

    async fn handle_transport(&mut self, event: TransportEvent) -> Result<(), CliError> {
        if let Some(line) = render::transport_event(&event) {
            self.print(&line).await?;
        }

        match event {
            TransportEvent::Message(message) => {
                match self.coordinator.handle_message(&message, self.env.now()) {
                    Ok(actions) => self.apply(actions).await?,
                    Err(e) => warn!(error = %e, kind = message.type_tag(), "message not handled"),
                }
                Ok(())
            },
            TransportEvent::Connected => {
                let Some(peer) = self.peer.clone() else { return Ok(()) };
                let actions = self.coordinator.ensure_session(&peer, self.env.now())?;
                self.apply(actions).await
            },
            TransportEvent::AuthExpired => Err(CliError::AuthExpired),
            TransportEvent::ConnectionLost { attempts } => Err(CliError::ConnectionLost { attempts }),
            TransportEvent::Unknown { kind } => {
                debug!(%kind, "ignoring unknown message");
                Ok(())
            },
            TransportEvent::Disconnected { .. } | TransportEvent::Reconnecting { .. } => Ok(()),
        }
    }

    async fn apply(&mut self, actions: Vec<CoordinatorAction>) -> Result<(), CliError> {
        for action in actions {
            match action {
                CoordinatorAction::Send(message) => self.client.send(message).await?,
                CoordinatorAction::Emit(event) => self.print(&render::session_event(&event)).await?,
            }
        }
        Ok(())
    }

    async fn backup(&mut self, path: &Path) -> Result<(), CliError> {
        let bundle = self.coordinator.vault().export_backup(self.coordinator.identity())?;
        tokio::fs::write(path, serde_json::to_vec_pretty(&bundle)?).await?;
        self.print(&format!("* backup written to {}", path.display())).await
    }

    async fn restore(&mut self, path: &Path) -> Result<(), CliError> {
        let bundle: EncryptedEnvelope = serde_json::from_slice(&tokio::fs::read(path).await?)?;
        let imported = self.coordinator.vault().import_backup(self.coordinator.identity(), &bundle)?;
        self.coordinator.restore(self.env.now())?;
        self.print(&format!("* imported {imported} sessions")).await
    }

    fn selected(&self) -> Result<String, ClientError> {
        self.peer.clone().ok_or_else(|| ClientError::InvalidPeer("none selected, use /peer <id>".to_string()))
    }

    async fn print(&mut self, line: &str) -> Result<(), CliError> {
        self.out.write_all(line.as_bytes()).await?;
        self.out.write_all(b"\n").await?;
        self.out.flush().await?;
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
