use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::{DeviceDescriptor, TransportKind, TransportRegistry};
use crate::error::MeshError;

/// A transport whose scan did not complete
#[derive(Debug)]
pub struct ScanFailure {
    pub kind: TransportKind,
    pub error: MeshError,
}

/// Devices found across all requested transports, plus the transports that failed
#[derive(Debug, Default)]
pub struct ScanReport {
    pub devices: Vec<DeviceDescriptor>,
    pub failures: Vec<ScanFailure>,
}

impl ScanReport {
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Runs discovery over the transports in a [`TransportRegistry`]
#[derive(Clone)]
pub struct TransportScanner {
    registry: TransportRegistry,
}

impl TransportScanner {
    pub fn new(registry: TransportRegistry) -> Self {
        Self { registry }
    }

    /// Scan each requested transport in turn.
    ///
    /// A transport that is unsupported in this build or whose scan fails is
    /// logged and recorded in [`ScanReport::failures`]; the others still run.
    pub async fn scan(&self, kinds: &[TransportKind]) -> ScanReport {
        let mut report = ScanReport::default();
        let mut seen = HashSet::new();

        for &kind in kinds {
            if !seen.insert(kind) {
                continue;
            }

            let transport = match self.registry.get(kind) {
                Ok(transport) => transport,
                Err(error) => {
                    info!("Skipping {kind} scan: {error}");
                    report.failures.push(ScanFailure { kind, error });
                    continue;
                }
            };

            debug!("Scanning for {kind} devices");
            match transport.scan().await {
                Ok(devices) => {
                    info!("Found {count} {kind} device(s)", count = devices.len());
                    report.devices.extend(devices);
                }
                Err(e) => {
                    warn!("{kind} scan failed: {e:#}");
                    report.failures.push(ScanFailure {
                        kind,
                        error: MeshError::Scan {
                            kind,
                            message: format!("{e:#}"),
                        },
                    });
                }
            }
        }

        report
    }

    /// Scan by transport name. An unrecognized name aborts before any scanning.
    pub async fn scan_named<S: AsRef<str>>(&self, names: &[S]) -> Result<ScanReport, MeshError> {
        let kinds = names
            .iter()
            .map(|name| TransportKind::parse(name.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.scan(&kinds).await)
    }

    /// Scan every transport registered in this build
    pub async fn scan_all(&self) -> ScanReport {
        let kinds = self.registry.kinds();
        self.scan(&kinds).await
    }
}

/// Drop devices whose address or display name is already known
pub fn filter_known(
    devices: Vec<DeviceDescriptor>,
    known: &HashSet<String>,
) -> Vec<DeviceDescriptor> {
    devices
        .into_iter()
        .filter(|d| !known.contains(&d.address) && !known.contains(&d.display_name))
        .collect()
}
