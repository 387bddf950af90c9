// SSH shell transport.
//
// Managed devices reject several operations over the REST surface (the
// device-initiated `copy flash:` transfer among them) and only accept them
// typed into an interactive shell. This module drives that shell: one
// cached connection per session, a fresh channel per command, the command
// (plus optional stdin payload, e.g. a transfer password) written to the
// channel and combined stdout/stderr collected until the remote closes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use russh::client::{self, Handle};
use russh::keys::PublicKey;
use russh::{ChannelMsg, Disconnect};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::error::Error;

/// Shell connections go stale on the same schedule as API tokens.
const STALENESS_WINDOW_SECS: i64 = 300;

/// Accepts any host key. Managed devices regenerate their keys on
/// factory reset and fleets are addressed by IP, so pinning is not
/// practical here -- the HTTPS transport carries the same posture.
struct AcceptingHandler;

impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// A cached SSH connection to one device.
pub(crate) struct ShellConn {
    handle: Handle<AcceptingHandler>,
    host: String,
    last_used: DateTime<Utc>,
}

impl ShellConn {
    /// Connect and authenticate with a password.
    pub(crate) async fn connect(
        host: &str,
        port: u16,
        username: &str,
        password: &SecretString,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(timeout),
            ..Default::default()
        });

        debug!(%host, port, "dialing shell");
        let mut handle = tokio::time::timeout(
            timeout,
            client::connect(config, (host, port), AcceptingHandler),
        )
        .await
        .map_err(|_| Error::Shell {
            target: host.to_owned(),
            message: format!("SSH connect timed out after {}s", timeout.as_secs()),
        })?
        .map_err(Error::Ssh)?;

        let authenticated = handle
            .authenticate_password(username, password.expose_secret())
            .await
            .map_err(Error::Ssh)?
            .success();
        if !authenticated {
            return Err(Error::Authentication {
                message: format!("SSH password rejected for user {username} on {host}"),
            });
        }

        Ok(Self {
            handle,
            host: host.to_owned(),
            last_used: Utc::now(),
        })
    }

    /// Whether this connection has crossed the staleness window.
    pub(crate) fn is_stale(&self) -> bool {
        Utc::now() - self.last_used > TimeDelta::seconds(STALENESS_WINDOW_SECS)
    }

    /// Run one command line through a remote shell.
    ///
    /// The device CLI does not implement `exec` requests, so the command
    /// is written to a shell channel followed by EOF, and output is
    /// drained until the remote side closes the channel.
    pub(crate) async fn exec(
        &mut self,
        command_line: &str,
        stdin: Option<&str>,
    ) -> Result<String, Error> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(Error::Ssh)?;
        channel.request_shell(true).await.map_err(Error::Ssh)?;

        let payload = match stdin {
            Some(extra) => format!("{command_line}\n{extra}\n"),
            None => format!("{command_line}\n"),
        };
        channel
            .data(payload.as_bytes())
            .await
            .map_err(Error::Ssh)?;
        channel.eof().await.map_err(Error::Ssh)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                _ => {}
            }
        }

        self.last_used = Utc::now();
        stdout.extend_from_slice(&stderr);
        String::from_utf8(stdout).map_err(|_| Error::Shell {
            target: self.host.clone(),
            message: "shell produced non-UTF-8 output".into(),
        })
    }

    /// Disconnect the underlying SSH connection.
    pub(crate) async fn close(self) -> Result<(), Error> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(Error::Ssh)
    }
}
