//! Best-effort per-event notification (the dashboard's alert sound)

use std::io::Write;

use anyhow::{Context, Result};

use super::event::StreamEvent;

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &StreamEvent) -> Result<()>;
}

/// Rings the terminal bell on stderr for each received event
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalBell;

impl Notifier for TerminalBell {
    fn notify(&self, _event: &StreamEvent) -> Result<()> {
        let mut stderr = std::io::stderr().lock();
        stderr.write_all(b"\x07").context("Failed to ring terminal bell")?;
        stderr.flush().context("Failed to flush stderr")?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

impl Notifier for Silent {
    fn notify(&self, _event: &StreamEvent) -> Result<()> {
        Ok(())
    }
}
