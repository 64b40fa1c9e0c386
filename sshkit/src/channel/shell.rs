//! Interactive shell on a PTY channel.

use log::debug;

use super::reader::PatternReader;
use crate::config::SessionConfig;
use crate::error::Result;
use crate::transport::{SessionChannel, Transport};

/// Terminal settings for the interactive shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSettings {
    /// Terminal type, e.g. `vt100` or `xterm`.
    pub term_type: String,

    /// Terminal width.
    pub width: u32,

    /// Terminal height.
    pub height: u32,
}

impl ShellSettings {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            term_type: config.term_type.clone(),
            width: config.width,
            height: config.height,
        }
    }
}

/// An open shell with a pseudo-terminal, read through a [`PatternReader`].
pub struct InteractiveShell<C> {
    reader: PatternReader<C>,
    settings: ShellSettings,
}

impl<C: SessionChannel> InteractiveShell<C> {
    /// Open a session channel, request a PTY and start a shell.
    pub async fn open<T>(transport: &T, config: &SessionConfig) -> Result<Self>
    where
        T: Transport<Channel = C>,
    {
        let settings = ShellSettings::from_config(config);
        let mut channel = transport.open_session().await?;
        channel
            .request_pty(&settings.term_type, settings.width, settings.height)
            .await?;
        channel.request_shell().await?;

        debug!(
            "opened shell ({} {}x{})",
            settings.term_type, settings.width, settings.height
        );

        Ok(Self {
            reader: PatternReader::new(channel, config)?,
            settings,
        })
    }

    /// Change the terminal size.
    pub async fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.reader.channel_mut().resize_pty(width, height).await?;
        self.settings.width = width;
        self.settings.height = height;
        Ok(())
    }

    /// Current terminal settings.
    pub fn settings(&self) -> &ShellSettings {
        &self.settings
    }

    pub fn reader(&self) -> &PatternReader<C> {
        &self.reader
    }

    pub fn reader_mut(&mut self) -> &mut PatternReader<C> {
        &mut self.reader
    }

    /// Close the shell channel.
    pub async fn close(self) -> Result<()> {
        let mut channel = self.reader.into_channel();
        channel.close().await
    }
}
