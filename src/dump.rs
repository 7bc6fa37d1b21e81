// MIT License - Copyright (c) 2026 Peter Wright
// Raw packet dump for diagnosing unknown installations

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::constants::{DEFAULT_PRIMARY_HEADER, HEADER_0_STATE, MIN_DUMP_TIME};
use crate::error::{Result, WallpadError};
use crate::transport::StreamTransport;

const MAX_LINE_ENTRIES: usize = 500;
const DUMP_POLL: Duration = Duration::from_secs(2);

/// Groups raw bus bytes into readable lines.
///
/// A line starts at every primary header byte. Within a line, `: ` marks
/// the start of a reply and `,  ` any other frame start.
#[derive(Debug, Default)]
pub struct DumpFormatter {
    entries: Vec<String>,
}

impl DumpFormatter {
    /// Add one byte; returns the completed line when this byte starts a new one.
    pub fn push(&mut self, byte: u8) -> Option<String> {
        if byte == DEFAULT_PRIMARY_HEADER || self.entries.len() > MAX_LINE_ENTRIES {
            let line = self.take();
            self.entries.push(format!("{byte:02X}"));
            return line;
        }
        let entry = match byte {
            b if b <= 0xA0 || b == 0xFF => format!("{b:02X}"),
            HEADER_0_STATE => format!(": {byte:02X}"),
            b => format!(",  {b:02X}"),
        };
        self.entries.push(entry);
        None
    }

    /// Flush whatever is buffered.
    pub fn take(&mut self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.entries).concat())
    }
}

/// Log raw traffic for `duration` (at least ten seconds).
pub async fn dump<S>(transport: &mut StreamTransport<S>, duration: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let duration = if duration < MIN_DUMP_TIME {
        warn!("dump_time is too short! automatically changed to {MIN_DUMP_TIME:?}");
        MIN_DUMP_TIME
    } else {
        duration
    };
    warn!("packet dump for {duration:?}!");

    let start = Instant::now();
    let mut formatter = DumpFormatter::default();
    while start.elapsed() < duration {
        let data = match transport.read_raw(DUMP_POLL).await {
            Ok(data) => data,
            Err(WallpadError::ReadTimeout) => continue,
            Err(e) => return Err(e),
        };
        for line in data.into_iter().filter_map(|b| formatter.push(b)) {
            info!("{line}");
        }
    }
    if let Some(line) = formatter.take() {
        info!("{line}");
    }
    warn!("dump done.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    fn format_all(bytes: &[u8]) -> Vec<String> {
        let mut f = DumpFormatter::default();
        let mut lines: Vec<String> = bytes.iter().filter_map(|b| f.push(*b)).collect();
        lines.extend(f.take());
        lines
    }

    #[test]
    fn test_lines_split_on_primary_header() {
        let lines = format_all(&[
            0xA1, 0x5A, 0x00, 0x7B, 0xB0, 0x5A, 0x00, 0x6A, 0xA1, 0x41, 0x00, 0x60,
        ]);
        assert_eq!(lines, vec!["A15A007B: B05A006A", "A1410060"]);
    }

    #[test]
    fn test_other_frame_starts_are_separated() {
        let lines = format_all(&[0xAC, 0x79, 0x00, 0x55, 0xFF]);
        assert_eq!(lines, vec![",  AC790055FF"]);
    }

    #[test]
    fn test_long_lines_wrap() {
        let lines = format_all(&[0x01; 600]);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), 501 * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dump_runs_for_minimum_time() {
        let (ours, mut bus) = duplex(64);
        let mut t = StreamTransport::new(ours, "test", Duration::from_secs(1));
        bus.write_all(&[0xA1, 0x5A, 0x00, 0x7B]).await.unwrap();

        let start = Instant::now();
        dump(&mut t, Duration::from_secs(1)).await.unwrap();
        assert!(start.elapsed() >= MIN_DUMP_TIME);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dump_survives_quiet_line() {
        let (ours, _bus) = duplex(64);
        let mut t = StreamTransport::new(ours, "test", Duration::from_secs(1));

        let start = Instant::now();
        dump(&mut t, Duration::from_secs(12)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(12));
    }
}
