//! Radio backends.
//!
//! - [`simulated`] - scripted and synthetic radios, always available
//! - `bluez` - BlueZ over D-Bus (Linux, `bluetooth` feature)
//!
//! A radio without a backend on the current host is represented by an
//! [`UnavailableScanSource`], so that callers get a uniform
//! `RadioUnavailable` failure instead of a missing controller.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::scan::{RawScanEvent, ScanError, ScanResult, ScanSource};
use crate::types::RadioKind;

#[cfg(feature = "bluetooth")]
pub mod bluez;
pub mod simulated;

/// Scan source for a radio this host cannot scan.
#[derive(Debug, Clone, Copy)]
pub struct UnavailableScanSource {
    kind: RadioKind,
}

impl UnavailableScanSource {
    /// Create a source that always reports `kind` as unavailable.
    #[must_use]
    pub const fn new(kind: RadioKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl ScanSource for UnavailableScanSource {
    fn kind(&self) -> RadioKind {
        self.kind
    }

    fn is_radio_enabled(&self) -> bool {
        true
    }

    async fn start_scan(&self) -> ScanResult<mpsc::Receiver<RawScanEvent>> {
        Err(ScanError::RadioUnavailable { kind: self.kind })
    }

    async fn stop_scan(&self) -> ScanResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::StreamExt;

    use super::*;
    use crate::scan::{start_scan, ScanOptions};

    #[tokio::test]
    async fn test_unavailable_source_fails_first() {
        let source = Arc::new(UnavailableScanSource::new(RadioKind::Wifi));
        let items: Vec<_> = start_scan(source, ScanOptions::default()).collect().await;
        assert_eq!(
            items,
            vec![Err(ScanError::RadioUnavailable {
                kind: RadioKind::Wifi
            })]
        );
    }
}
