use crate::commands::{self, Source};
use crate::error::{ArcamError, Result};
use crate::protocol::{Command, Response};
use crate::session::Session;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Interface for controlling one zone of a receiver
///
/// Device-level rejections (non-zero answer codes) are reported as
/// [`ArcamError::Device`]. Several `Zone`s can share one [`Session`].
#[derive(Clone)]
pub struct Zone {
    session: Arc<Session>,
    zone: u8,
}

/// Snapshot of the commonly polled zone state
///
/// Fields are `None` when the receiver did not report them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneStatus {
    pub zone: u8,
    pub power: Option<bool>,
    pub volume: Option<u8>,
    pub muted: Option<bool>,
    pub source: Option<Source>,
}

impl ZoneStatus {
    pub fn new(zone: u8) -> Self {
        Self {
            zone,
            ..Default::default()
        }
    }

    /// Fold a response (typically a broadcast) into the snapshot
    ///
    /// Returns `true` if the response was for this zone and changed a field.
    pub fn apply(&mut self, response: &Response) -> bool {
        if response.zone != self.zone || !response.is_success() {
            return false;
        }

        let before = self.clone();
        let payload = &response.payload;
        let decoded = match response.code {
            commands::POWER => commands::decode_power(payload).map(|on| self.power = Some(on)),
            commands::VOLUME => commands::decode_volume(payload).map(|v| self.volume = Some(v)),
            commands::MUTE => commands::decode_mute(payload).map(|muted| self.muted = Some(muted)),
            commands::SOURCE => commands::decode_source(payload).map(|s| self.source = Some(s)),
            _ => return false,
        };

        if let Err(e) = decoded {
            tracing::debug!("Zone {} ignoring malformed status: {}", self.zone, e);
            return false;
        }
        *self != before
    }
}

impl Zone {
    pub fn new(session: Arc<Session>, zone: u8) -> Self {
        Self { session, zone }
    }

    /// Get the zone number
    pub fn zone(&self) -> u8 {
        self.zone
    }

    /// Get the underlying session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    async fn execute(&self, command: Command) -> Result<Response> {
        let response = self.session.send(&command).await?;
        if !response.is_success() {
            return Err(ArcamError::Device(response.answer_code()));
        }
        Ok(response)
    }

    pub async fn power_on(&self) -> Result<()> {
        self.execute(Command::power_on(self.zone)).await?;
        Ok(())
    }

    /// Put the zone into standby
    pub async fn power_off(&self) -> Result<()> {
        self.execute(Command::power_off(self.zone)).await?;
        Ok(())
    }

    pub async fn is_powered(&self) -> Result<bool> {
        let response = self.execute(Command::power_status(self.zone)).await?;
        commands::decode_power(&response.payload)
    }

    /// Set the volume step (0-99)
    pub async fn set_volume(&self, volume: u8) -> Result<()> {
        self.execute(Command::set_volume(self.zone, volume)?).await?;
        Ok(())
    }

    pub async fn volume(&self) -> Result<u8> {
        let response = self.execute(Command::volume_status(self.zone)).await?;
        commands::decode_volume(&response.payload)
    }

    pub async fn is_muted(&self) -> Result<bool> {
        let response = self.execute(Command::mute_status(self.zone)).await?;
        commands::decode_mute(&response.payload)
    }

    /// Toggle mute via a simulated remote key press
    ///
    /// The reply to an RC5 command is not interpreted; query
    /// [`Zone::is_muted`] for the resulting state.
    pub async fn toggle_mute(&self) -> Result<()> {
        self.execute(Command::toggle_mute(self.zone)).await?;
        Ok(())
    }

    pub async fn source(&self) -> Result<Source> {
        let response = self.execute(Command::source_status(self.zone)).await?;
        commands::decode_source(&response.payload)
    }

    /// Select an input via a simulated remote key press
    pub async fn select_source(&self, source: Source) -> Result<()> {
        self.execute(Command::select_source(self.zone, source)).await?;
        Ok(())
    }

    pub async fn software_version(&self) -> Result<String> {
        let response = self.execute(Command::software_version(self.zone)).await?;
        commands::decode_software_version(&response.payload)
    }

    /// Poll power, volume, mute and source
    ///
    /// Queries the receiver rejects leave the field empty; connection
    /// failures and timeouts abort the poll.
    pub async fn status(&self) -> Result<ZoneStatus> {
        let mut status = ZoneStatus::new(self.zone);
        let queries = [
            Command::power_status(self.zone),
            Command::volume_status(self.zone),
            Command::mute_status(self.zone),
            Command::source_status(self.zone),
        ];

        for command in queries {
            let response = self.session.send(&command).await?;
            if !status.apply(&response) && !response.is_success() {
                tracing::debug!(
                    "Zone {} status query 0x{:02X} rejected: {}",
                    self.zone,
                    command.code(),
                    response.answer_code()
                );
            }
        }

        Ok(status)
    }
}
